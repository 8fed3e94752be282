//! Fixed-size pool of compiler workers with blocking leases.
//!
//! Callers rendezvous on a mutex/condvar pair: a lease takes the first
//! populated slot, and releasing it wakes one waiter. Each leased worker is
//! held exclusively for the duration of one compile.

use std::cmp;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::error;

use crate::config::{CompilerOptions, ConfigRegistry};
use crate::error::{CompilerError, Result};
use crate::launcher::Launcher;
use crate::md5::Md5;
use crate::unit::{AsmCallbacks, Assembler, UnitEmitter};
use crate::worker::ExternCompiler;

/// Outcome of a pooled compile: an assembled unit, or diagnostic text.
#[derive(Debug)]
pub enum CompileResult {
    Unit(UnitEmitter),
    Error(String),
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Total worker slots.
    pub workers: usize,
    /// Slots currently holding an unleased worker.
    pub idle: usize,
}

/// A fixed set of compiler workers plus the rendezvous arbitrating access.
pub struct CompilerPool {
    options: Arc<CompilerOptions>,
    registry: Arc<dyn ConfigRegistry>,
    assembler: Arc<dyn Assembler>,
    launcher: Arc<Launcher>,
    slots: Mutex<Vec<Option<ExternCompiler>>>,
    available: Condvar,
    free_count: AtomicUsize,
    version: Mutex<String>,
}

impl CompilerPool {
    pub fn new(
        options: CompilerOptions,
        registry: Arc<dyn ConfigRegistry>,
        assembler: Arc<dyn Assembler>,
        launcher: Arc<Launcher>,
    ) -> Self {
        let workers = options.workers as usize;
        Self {
            options: Arc::new(options),
            registry,
            assembler,
            launcher,
            slots: Mutex::new((0..workers).map(|_| None).collect()),
            available: Condvar::new(),
            free_count: AtomicUsize::new(0),
            version: Mutex::new(String::new()),
        }
    }

    /// Populate every slot with an idle worker, then bring one up to cache
    /// the pool-wide version string.
    pub fn start(&self) -> Result<()> {
        {
            let mut slots = self.slots.lock().expect("compiler pool mutex poisoned");
            for slot in slots.iter_mut() {
                *slot = Some(ExternCompiler::new(
                    self.options.clone(),
                    self.registry.clone(),
                    self.launcher.clone(),
                ));
            }
            self.free_count.store(slots.len(), Ordering::Relaxed);
        }

        let version = {
            let mut compiler = self.acquire();
            compiler.version()?
        };
        *self.version.lock().expect("compiler pool mutex poisoned") = version;
        Ok(())
    }

    /// Version string cached by [`start`](Self::start); empty before it runs.
    pub fn version(&self) -> String {
        self.version
            .lock()
            .expect("compiler pool mutex poisoned")
            .clone()
    }

    /// Lease a worker, blocking until a slot frees up.
    pub fn acquire(&self) -> CompilerGuard<'_> {
        let mut slots = self.slots.lock().expect("compiler pool mutex poisoned");
        while self.free_count.load(Ordering::Relaxed) == 0 {
            slots = self
                .available
                .wait(slots)
                .expect("compiler pool mutex poisoned");
        }
        self.free_count.fetch_sub(1, Ordering::Relaxed);

        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(compiler) = slot.take() {
                return CompilerGuard {
                    pool: self,
                    index,
                    compiler: Some(compiler),
                };
            }
        }

        unreachable!("free count was nonzero but every slot is empty")
    }

    fn release(&self, index: usize, compiler: ExternCompiler) {
        {
            let mut slots = self.slots.lock().expect("compiler pool mutex poisoned");
            slots[index] = Some(compiler);
            self.free_count.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
    }

    /// Tear down every pooled worker. With `detach` set the workers forget
    /// their pids first, so no signal or wait touches processes a forked
    /// child does not own.
    pub fn shutdown(&self, detach: bool) {
        let mut slots = self.slots.lock().expect("compiler pool mutex poisoned");
        for slot in slots.iter_mut() {
            if let Some(mut compiler) = slot.take() {
                if detach {
                    compiler.detach_from_process();
                }
            }
        }
        self.free_count.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.options.workers as usize,
            idle: self.free_count.load(Ordering::Relaxed),
        }
    }

    /// Compile one source file on a leased worker, retrying transport
    /// failures up to `max_retries` extra attempts.
    pub fn compile(
        &self,
        code: &[u8],
        filename: &str,
        md5: &Md5,
        mut callbacks: Option<&mut dyn AsmCallbacks>,
    ) -> Result<CompileResult> {
        let mut compiler = self.acquire();
        let mut err = String::new();

        let max = cmp::max(1, self.options.max_retries + 1);
        for attempt in 1..=max {
            match compiler.compile(filename, md5, code) {
                Ok(hhas) => {
                    return Ok(self.assemble(&hhas, code, filename, md5, callbacks.take()));
                }
                Err(CompilerError::Transport(message)) => {
                    // The worker stopped itself; the next attempt restarts it.
                    err.push_str(&message);
                    if attempt < max {
                        err.push('\n');
                    }
                }
                Err(CompilerError::Compile(message)) => {
                    return Ok(CompileResult::Error(message))
                }
                Err(fatal) => return Err(fatal),
            }
        }

        if self.options.verbose_errors {
            error!("ExternCompiler encountered too many communication errors, giving up.");
        }
        Ok(CompileResult::Error(err))
    }

    fn assemble(
        &self,
        hhas: &[u8],
        code: &[u8],
        filename: &str,
        md5: &Md5,
        callbacks: Option<&mut dyn AsmCallbacks>,
    ) -> CompileResult {
        match self.assembler.assemble(hhas, filename, md5, callbacks) {
            Ok(unit) => CompileResult::Unit(unit),
            Err(message) => {
                if self.options.verbose_errors {
                    let detail = format!(
                        "{message}\n\
                         ========== PHP Source ==========\n{}\n\
                         ========== ExternCompiler Result ==========\n{}\n",
                        String::from_utf8_lossy(code),
                        String::from_utf8_lossy(hhas),
                    );
                    error!("ExternCompiler Generated a bad unit: {detail}");
                    CompileResult::Error(detail)
                } else {
                    CompileResult::Error(message)
                }
            }
        }
    }
}

impl Drop for CompilerPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

/// Scoped exclusive access to one pooled worker.
///
/// The lease is returned to its slot on drop, on every exit path.
pub struct CompilerGuard<'a> {
    pool: &'a CompilerPool,
    index: usize,
    compiler: Option<ExternCompiler>,
}

impl Deref for CompilerGuard<'_> {
    type Target = ExternCompiler;

    fn deref(&self) -> &ExternCompiler {
        self.compiler.as_ref().expect("compiler lease already released")
    }
}

impl DerefMut for CompilerGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExternCompiler {
        self.compiler.as_mut().expect("compiler lease already released")
    }
}

impl Drop for CompilerGuard<'_> {
    fn drop(&mut self) {
        if let Some(compiler) = self.compiler.take() {
            self.pool.release(self.index, compiler);
        }
    }
}
