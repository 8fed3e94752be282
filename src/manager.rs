//! Process-wide lifecycle for the compiler pool.
//!
//! One eagerly constructed [`CompilerManager`] owns the pool, the launcher
//! delegate, and the started flag. Start is double-checked: readers see
//! `started` with acquire ordering only after the pool is fully built under
//! the start mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tracing::warn;

use crate::config::{self, ConfigRegistry, HackcMode};
use crate::error::{CompilerError, Result};
use crate::launcher::Launcher;
use crate::md5::Md5;
use crate::pool::{CompileResult, CompilerPool};
use crate::unit::{AsmCallbacks, Assembler};

/// Owns the pool and gates its startup and teardown.
pub struct CompilerManager {
    registry: RwLock<Option<Arc<dyn ConfigRegistry>>>,
    assembler: RwLock<Option<Arc<dyn Assembler>>>,
    launcher: OnceLock<Arc<Launcher>>,
    pool: Mutex<Option<Arc<CompilerPool>>>,
    started: AtomicBool,
    start_lock: Mutex<()>,
    username: Mutex<Option<String>>,
}

impl CompilerManager {
    /// A manager with no collaborators installed yet.
    pub const fn new() -> Self {
        Self {
            registry: RwLock::new(None),
            assembler: RwLock::new(None),
            launcher: OnceLock::new(),
            pool: Mutex::new(None),
            started: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            username: Mutex::new(None),
        }
    }

    /// Register the host's settings registry and assembler.
    pub fn install(&self, registry: Arc<dyn ConfigRegistry>, assembler: Arc<dyn Assembler>) {
        *self.registry.write().expect("compiler manager poisoned") = Some(registry);
        *self.assembler.write().expect("compiler manager poisoned") = Some(assembler);
    }

    /// Record a username; the launcher delegate switches to it at startup.
    pub fn set_username(&self, username: &str) {
        *self.username.lock().expect("compiler manager poisoned") = Some(username.to_string());
    }

    fn launcher(&self) -> &Arc<Launcher> {
        self.launcher.get_or_init(|| Arc::new(Launcher::new()))
    }

    pub(crate) fn registry(&self) -> Option<Arc<dyn ConfigRegistry>> {
        self.registry
            .read()
            .expect("compiler manager poisoned")
            .clone()
    }

    pub(crate) fn assembler(&self) -> Option<Arc<dyn Assembler>> {
        self.assembler
            .read()
            .expect("compiler manager poisoned")
            .clone()
    }

    /// The operating mode derived from the installed registry.
    pub fn mode(&self) -> HackcMode {
        if cfg!(not(unix)) {
            return HackcMode::Never;
        }
        match self.registry() {
            Some(registry) => config::mode_of(&*registry),
            None => HackcMode::Never,
        }
    }

    /// Whether a pool is up.
    pub fn enabled(&self) -> bool {
        self.pool
            .lock()
            .expect("compiler manager poisoned")
            .is_some()
    }

    /// Start the pool if it is not running, once per process at a time.
    ///
    /// A disabled or misconfigured registry records a completed start with no
    /// pool, so the broker stays quiet instead of failing every caller.
    pub fn ensure_started(&self) -> Result<()> {
        if cfg!(not(unix)) {
            return Ok(());
        }
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let _start = self.start_lock.lock().expect("compiler manager poisoned");
        if self.started.load(Ordering::Relaxed) {
            return Ok(());
        }

        let collaborators = (self.registry(), self.assembler());
        if let (Some(registry), Some(assembler)) = collaborators {
            if let Some(options) = config::options_from(&*registry) {
                let launcher = self.launcher().clone();
                launcher.create_delegate();

                let username = self
                    .username
                    .lock()
                    .expect("compiler manager poisoned")
                    .clone();
                if let Some(username) = username {
                    let delegate = launcher.delegate();
                    if let Err(e) = delegate.change_user(&username) {
                        warn!("unable to switch compiler delegate to user {username}: {e}");
                    }
                }

                let pool = Arc::new(CompilerPool::new(options, registry, assembler, launcher));
                pool.start()?;
                *self.pool.lock().expect("compiler manager poisoned") = Some(pool);
            }
        }

        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the pool and close the launcher delegate.
    pub fn shutdown(&self) {
        self.stop(false);
    }

    /// Drop the pool without signaling workers owned by the pre-fork parent.
    /// Registered as a post-fork child hook by [`compilers_start`].
    pub fn detach_after_fork(&self) {
        self.stop(true);
    }

    fn stop(&self, detach: bool) {
        let pool = self.pool.lock().expect("compiler manager poisoned").take();
        if let Some(pool) = pool {
            pool.shutdown(detach);
        }
        self.launcher().close_delegate();
        self.started.store(false, Ordering::Relaxed);
    }

    fn hackc_pool(&self) -> Result<Arc<CompilerPool>> {
        self.ensure_started()?;
        self.pool
            .lock()
            .expect("compiler manager poisoned")
            .clone()
            .ok_or_else(|| CompilerError::BadCompiler("external compiler is not enabled".into()))
    }

    /// Compile through the pool; see [`CompilerPool::compile`].
    pub fn compile(
        &self,
        code: &[u8],
        filename: &str,
        md5: &Md5,
        callbacks: Option<&mut dyn AsmCallbacks>,
    ) -> Result<CompileResult> {
        self.hackc_pool()?.compile(code, filename, md5, callbacks)
    }

    /// The pool's cached compiler version string.
    pub fn version(&self) -> Result<String> {
        Ok(self.hackc_pool()?.version())
    }
}

impl Default for CompilerManager {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: CompilerManager = CompilerManager::new();

pub(crate) fn global() -> &'static CompilerManager {
    &GLOBAL
}

/// Install the host collaborators and bring the pool up.
///
/// Also registers [`compilers_detach_after_fork`] as a post-fork child hook,
/// so forked processes disown inherited workers instead of killing them.
pub fn compilers_start(
    registry: Arc<dyn ConfigRegistry>,
    assembler: Arc<dyn Assembler>,
) -> Result<()> {
    GLOBAL.install(registry, assembler);
    GLOBAL.ensure_started()?;
    register_fork_hook();
    Ok(())
}

/// Stop the pool and close the launcher delegate.
pub fn compilers_shutdown() {
    GLOBAL.shutdown();
}

/// Post-fork child hook: drop inherited workers without signaling them.
pub fn compilers_detach_after_fork() {
    GLOBAL.detach_after_fork();
}

/// Run compiler children as `username` once the pool starts.
pub fn compilers_set_user(username: &str) {
    GLOBAL.set_username(username);
}

/// Compile one source file through the process-wide pool.
pub fn compile(
    code: &[u8],
    filename: &str,
    md5: &Md5,
    callbacks: Option<&mut dyn AsmCallbacks>,
) -> Result<CompileResult> {
    GLOBAL.compile(code, filename, md5, callbacks)
}

/// Version string reported by the pooled compiler.
pub fn version() -> Result<String> {
    GLOBAL.version()
}

/// The process-wide operating mode.
pub fn hackc_mode() -> HackcMode {
    GLOBAL.mode()
}

#[cfg(unix)]
fn register_fork_hook() {
    use std::sync::Once;

    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        extern "C" fn detach_in_child() {
            compilers_detach_after_fork();
        }
        // SAFETY: registering a process-lifetime handler with no data.
        unsafe {
            libc::pthread_atfork(None, None, Some(detach_in_child));
        }
    });
}

#[cfg(not(unix))]
fn register_fork_hook() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitEmitter;

    struct DisabledRegistry;

    impl ConfigRegistry for DisabledRegistry {
        fn enabled(&self) -> bool {
            false
        }
    }

    struct NullAssembler;

    impl Assembler for NullAssembler {
        fn assemble(
            &self,
            _hhas: &[u8],
            _filename: &str,
            _md5: &Md5,
            _callbacks: Option<&mut dyn AsmCallbacks>,
        ) -> std::result::Result<UnitEmitter, String> {
            Ok(UnitEmitter::new(()))
        }

        fn fatal_unit(&self, _filename: &str, _md5: &Md5, _message: &str) -> UnitEmitter {
            UnitEmitter::new(())
        }
    }

    #[test]
    fn test_uninstalled_manager_reports_never() {
        let manager = CompilerManager::new();
        assert_eq!(manager.mode(), HackcMode::Never);
        assert!(!manager.enabled());
    }

    #[test]
    fn test_disabled_registry_starts_without_pool() {
        let manager = CompilerManager::new();
        manager.install(Arc::new(DisabledRegistry), Arc::new(NullAssembler));

        manager.ensure_started().unwrap();
        assert_eq!(manager.mode(), HackcMode::Never);
        assert!(!manager.enabled());

        let err = manager
            .compile(b"<?hh", "f.hack", &Md5::from_bytes([0; 16]), None)
            .unwrap_err();
        assert!(matches!(err, CompilerError::BadCompiler(_)));
        assert!(matches!(
            manager.version().unwrap_err(),
            CompilerError::BadCompiler(_)
        ));
    }

    #[test]
    fn test_shutdown_resets_started() {
        let manager = CompilerManager::new();
        manager.install(Arc::new(DisabledRegistry), Arc::new(NullAssembler));
        manager.ensure_started().unwrap();
        assert!(manager.started.load(Ordering::Relaxed));

        manager.shutdown();
        assert!(!manager.started.load(Ordering::Relaxed));
    }
}
