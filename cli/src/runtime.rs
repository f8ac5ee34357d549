//! Loading demo modules into wasmtime and calling their exports.
//!
//! A [`DemoHost`] owns a compiled module plus a linker with WASI preview 1
//! wired in. Each [`Session`] is one instance with its own store, stdout and
//! preopened app directory. Export calls return [`InvokeError`] so callers can
//! tell a guest fault from an interrupt or a host problem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, Instance, Linker, Module, OptLevel, Store, Trap, TypedFunc, UpdateDeadline,
    WasmParams, WasmResults,
};
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit};

use crate::shutdown::Shutdown;

/// Guest directory that holds the file `readFile` opens.
pub const GUEST_APP_DIR: &str = "/usr/src/app";

const STDOUT_CAPACITY: usize = 1 << 20;

pub mod exports {
    pub const ADD: &str = "add";
    pub const READ_FILE: &str = "readFile";
    pub const START: &str = "_start";
    pub const LOAD_AND_INCREMENT: &str = "loadAndIncrement";
    pub const INITIALIZE: &str = "_initialize";
    pub const MEMORY: &str = "memory";
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("module does not export `{name}` as expected: {reason}")]
    MissingExport { name: String, reason: String },

    #[error("`{export}` faulted: {message}")]
    Fault { export: String, message: String },

    #[error("`{export}` was interrupted")]
    Interrupted { export: String },

    #[error("guest exited with status {0}")]
    Exited(i32),

    #[error("location {location} is outside linear memory of {size} bytes")]
    OutOfBounds { location: u32, size: usize },

    #[error(transparent)]
    Host(#[from] anyhow::Error),
}

impl InvokeError {
    fn classify(export: &str, err: anyhow::Error) -> Self {
        if let Some(exit) = err.downcast_ref::<I32Exit>() {
            return InvokeError::Exited(exit.0);
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => InvokeError::Interrupted {
                export: export.to_string(),
            },
            Some(trap) => InvokeError::Fault {
                export: export.to_string(),
                message: trap.to_string(),
            },
            None => InvokeError::Host(err),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Host directory preopened read-only as [`GUEST_APP_DIR`].
    pub app_dir: Option<PathBuf>,
    /// Keep guest stdout in memory instead of inheriting the host's.
    pub capture_stdout: bool,
}

pub fn create_engine() -> Result<Engine> {
    let mut config = Config::new();
    config.cranelift_opt_level(OptLevel::Speed);
    config.strategy(wasmtime::Strategy::Cranelift);
    config.epoch_interruption(true);
    Engine::new(&config).context("creating wasmtime engine")
}

pub struct DemoHost {
    engine: Engine,
    module: Module,
    linker: Linker<WasiP1Ctx>,
}

impl DemoHost {
    /// Compiles a `.wasm` binary or `.wat` text file.
    pub fn from_file(engine: &Engine, path: &Path) -> Result<Self> {
        let module = Module::from_file(engine, path)
            .with_context(|| format!("compiling module {}", path.display()))?;
        info!(module = %path.display(), "module loaded");
        Self::with_module(engine, module)
    }

    pub fn from_bytes(engine: &Engine, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let module = Module::new(engine, bytes).context("compiling module")?;
        Self::with_module(engine, module)
    }

    fn with_module(engine: &Engine, module: Module) -> Result<Self> {
        let mut linker = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |ctx| ctx).context("linking WASI")?;
        Ok(Self {
            engine: engine.clone(),
            module,
            linker,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Instantiates the module. The store traps with [`Trap::Interrupt`] on the
    /// first epoch tick after `shutdown` is requested.
    pub fn session(&self, config: &HostConfig, shutdown: Arc<Shutdown>) -> Result<Session> {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stderr();

        let stdout = if config.capture_stdout {
            let pipe = MemoryOutputPipe::new(STDOUT_CAPACITY);
            builder.stdout(pipe.clone());
            Some(pipe)
        } else {
            builder.inherit_stdout();
            None
        };

        if let Some(dir) = &config.app_dir {
            builder
                .preopened_dir(dir, GUEST_APP_DIR, DirPerms::READ, FilePerms::READ)
                .with_context(|| {
                    format!("preopening {} as {GUEST_APP_DIR}", dir.display())
                })?;
            debug!(host = %dir.display(), guest = GUEST_APP_DIR, "app dir preopened");
        }

        let mut store = Store::new(&self.engine, builder.build_p1());
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if shutdown.is_requested() {
                Err(Trap::Interrupt.into())
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .context("instantiating module")?;

        let mut session = Session {
            store,
            instance,
            stdout,
        };
        session.initialize()?;
        Ok(session)
    }
}

pub struct Session {
    store: Store<WasiP1Ctx>,
    instance: Instance,
    stdout: Option<MemoryOutputPipe>,
}

impl Session {
    /// Runs the reactor constructor if the module has one.
    fn initialize(&mut self) -> Result<(), InvokeError> {
        if self
            .instance
            .get_func(&mut self.store, exports::INITIALIZE)
            .is_none()
        {
            return Ok(());
        }
        debug!("running reactor initializer");
        self.call::<(), ()>(exports::INITIALIZE, ())
    }

    pub fn add(&mut self, a: i32, b: i32) -> Result<i32, InvokeError> {
        self.call(exports::ADD, (a, b))
    }

    pub fn read_file(&mut self) -> Result<i32, InvokeError> {
        self.call(exports::READ_FILE, ())
    }

    /// Calls `_start`. A conforming guest never returns, so this ends with
    /// [`InvokeError::Interrupted`] once shutdown is requested.
    pub fn start(&mut self) -> Result<(), InvokeError> {
        self.call(exports::START, ())
    }

    /// Stores `value` little-endian at `location` in the guest memory, then
    /// calls `loadAndIncrement(location)`.
    pub fn load_and_increment(&mut self, value: u32, location: u32) -> Result<u32, InvokeError> {
        let memory = self
            .instance
            .get_memory(&mut self.store, exports::MEMORY)
            .ok_or_else(|| InvokeError::MissingExport {
                name: exports::MEMORY.to_string(),
                reason: "no exported linear memory".to_string(),
            })?;

        let size = memory.data_size(&self.store);
        let offset = location as usize;
        if offset.checked_add(4).map_or(true, |end| end > size) {
            return Err(InvokeError::OutOfBounds { location, size });
        }
        memory
            .write(&mut self.store, offset, &value.to_le_bytes())
            .context("writing guest memory")?;

        self.call(exports::LOAD_AND_INCREMENT, location)
    }

    /// Everything the guest has written to stdout, when captured.
    pub fn captured_stdout(&self) -> Option<String> {
        self.stdout
            .as_ref()
            .map(|pipe| String::from_utf8_lossy(&pipe.contents()).into_owned())
    }

    fn typed<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>, InvokeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|err| InvokeError::MissingExport {
                name: name.to_string(),
                reason: format!("{err:#}"),
            })
    }

    fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, InvokeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.typed::<P, R>(name)?;
        info!(export = name, "calling export");
        let result = func
            .call(&mut self.store, params)
            .map_err(|err| InvokeError::classify(name, err));
        match &result {
            Ok(_) => debug!(export = name, "export returned"),
            Err(err) => debug!(export = name, error = %err, "export failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_EXPORTS: &str = "(module)";

    fn session_for(wat: &str) -> Session {
        let engine = create_engine().unwrap();
        let host = DemoHost::from_bytes(&engine, wat).unwrap();
        let config = HostConfig {
            capture_stdout: true,
            ..HostConfig::default()
        };
        host.session(&config, Arc::new(Shutdown::new())).unwrap()
    }

    #[test]
    fn missing_export_is_reported_by_name() {
        let mut session = session_for(NO_EXPORTS);
        match session.add(1, 2) {
            Err(InvokeError::MissingExport { name, .. }) => assert_eq!(name, "add"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_signature_is_a_missing_export() {
        let mut session = session_for(r#"(module (func (export "add") (param i64) (result i64) local.get 0))"#);
        assert!(matches!(
            session.add(1, 2),
            Err(InvokeError::MissingExport { .. })
        ));
    }

    #[test]
    fn reactor_initializer_runs_before_exports() {
        let mut session = session_for(
            r#"(module
                (global $ready (mut i32) (i32.const 0))
                (func (export "_initialize") (global.set $ready (i32.const 1)))
                (func (export "readFile") (result i32) global.get $ready))"#,
        );
        assert_eq!(session.read_file().unwrap(), 1);
    }

    #[test]
    fn missing_memory_blocks_increment() {
        let mut session = session_for(NO_EXPORTS);
        match session.load_and_increment(1, 0) {
            Err(InvokeError::MissingExport { name, .. }) => assert_eq!(name, "memory"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn captured_stdout_is_empty_before_any_output() {
        let session = session_for(NO_EXPORTS);
        assert_eq!(session.captured_stdout().as_deref(), Some(""));
    }

    #[test]
    fn trap_is_classified_as_fault() {
        let mut session = session_for(r#"(module (func (export "readFile") (result i32) unreachable))"#);
        match session.read_file() {
            Err(InvokeError::Fault { export, .. }) => assert_eq!(export, "readFile"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn proc_exit_is_classified_as_exit() {
        let mut session = session_for(
            r#"(module
                (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
                (func (export "_start") (call $exit (i32.const 3))))"#,
        );
        assert!(matches!(session.start(), Err(InvokeError::Exited(3))));
    }

    #[test]
    fn shutdown_interrupts_a_running_export() {
        let engine = create_engine().unwrap();
        let host = DemoHost::from_bytes(
            &engine,
            r#"(module (func (export "_start") (loop $again (br $again))))"#,
        )
        .unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let mut session = host
            .session(&HostConfig::default(), shutdown.clone())
            .unwrap();

        let ticker = crate::shutdown::spawn_epoch_ticker(engine.clone(), shutdown.clone());
        let stopper = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(150));
                shutdown.request();
            })
        };

        let result = session.start();
        stopper.join().unwrap();
        ticker.join().unwrap();
        match result {
            Err(InvokeError::Interrupted { export }) => assert_eq!(export, "_start"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn increment_location_is_bounds_checked_before_the_call() {
        let mut session = session_for(
            r#"(module
                (memory (export "memory") 1)
                (func (export "loadAndIncrement") (param i32) (result i32)
                    (i32.add (i32.load (local.get 0)) (i32.const 1))))"#,
        );
        // One page is 65536 bytes; the last full u32 starts at 65532.
        assert_eq!(session.load_and_increment(7, 65532).unwrap(), 8);
        match session.load_and_increment(7, 65533) {
            Err(InvokeError::OutOfBounds { location, size }) => {
                assert_eq!(location, 65533);
                assert_eq!(size, 65536);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn preopening_a_missing_dir_fails() {
        let engine = create_engine().unwrap();
        let host = DemoHost::from_bytes(&engine, NO_EXPORTS).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            app_dir: Some(dir.path().join("nope")),
            capture_stdout: true,
        };
        assert!(host.session(&config, Arc::new(Shutdown::new())).is_err());
    }
}
