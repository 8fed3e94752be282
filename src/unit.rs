//! Assembler seam and the unit-compiler factory callers go through.
//!
//! The broker hands artifact bytes to a host-registered [`Assembler`] and
//! passes the resulting [`UnitEmitter`] back without ever looking inside it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::HackcMode;
use crate::error::{CompilerError, Result};
use crate::manager;
use crate::md5::Md5;
use crate::pool::CompileResult;

/// Opaque handle to an assembled unit.
///
/// Produced by the host's assembler; the embedding VM downcasts it back to
/// its own emitter type.
pub struct UnitEmitter {
    unit: Box<dyn Any + Send>,
}

impl UnitEmitter {
    pub fn new<T: Any + Send>(unit: T) -> Self {
        Self {
            unit: Box::new(unit),
        }
    }

    pub fn downcast<T: Any>(self) -> std::result::Result<Box<T>, UnitEmitter> {
        self.unit.downcast().map_err(|unit| UnitEmitter { unit })
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.unit.downcast_ref()
    }
}

impl fmt::Debug for UnitEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnitEmitter")
    }
}

/// Event sink the assembler may report into while assembling.
///
/// The broker forwards it untouched; every method defaults to a no-op.
pub trait AsmCallbacks {
    fn on_include(&mut self, _path: &str) {}
    fn on_constant_ref(&mut self, _name: &str) {}
    fn on_function_ref(&mut self, _name: &str) {}
    fn on_class_ref(&mut self, _name: &str) {}
}

/// Turns artifact text into in-memory units. Implemented by the host VM.
pub trait Assembler: Send + Sync {
    /// Assemble `hhas` into a unit, or explain why it is unusable.
    fn assemble(
        &self,
        hhas: &[u8],
        filename: &str,
        md5: &Md5,
        callbacks: Option<&mut dyn AsmCallbacks>,
    ) -> std::result::Result<UnitEmitter, String>;

    /// Build a synthetic unit that fatals with `message` when loaded.
    fn fatal_unit(&self, filename: &str, md5: &Md5, message: &str) -> UnitEmitter;
}

static SYSTEMLIB_INITED: AtomicBool = AtomicBool::new(false);

/// Record that the systemlib has finished loading. Until then, `code` frames
/// are flagged `is_systemlib` and the factory stays out of the way unless
/// configured otherwise.
pub fn set_systemlib_initialized(inited: bool) {
    SYSTEMLIB_INITED.store(inited, Ordering::Relaxed);
}

pub(crate) fn in_systemlib_phase() -> bool {
    !SYSTEMLIB_INITED.load(Ordering::Relaxed)
}

/// Whether `code` looks like a Hack source file: an optional shebang line
/// followed by the `<?hh` marker.
pub fn is_hack_file(code: &[u8]) -> bool {
    let mut code = code;
    if code.starts_with(b"#!") {
        match code.iter().position(|&b| b == b'\n') {
            Some(newline) => code = &code[newline + 1..],
            None => return false,
        }
    }
    code.len() > 4 && code.starts_with(b"<?hh")
}

/// A compile request bound to the process-wide pool.
///
/// Created by [`UnitCompiler::create`], which returns `None` whenever the
/// external compiler should not handle the file.
pub struct UnitCompiler<'a> {
    code: &'a [u8],
    filename: &'a str,
    md5: Md5,
    mode: HackcMode,
}

impl<'a> UnitCompiler<'a> {
    pub fn create(code: &'a [u8], filename: &'a str, md5: Md5) -> Result<Option<Self>> {
        let global = manager::global();
        global.ensure_started()?;

        let Some(registry) = global.registry() else {
            return Ok(None);
        };
        if in_systemlib_phase() && !registry.use_for_systemlib() {
            return Ok(None);
        }

        let mode = global.mode();
        if mode == HackcMode::Never || !global.enabled() {
            return Ok(None);
        }

        Ok(Some(Self {
            code,
            filename,
            md5,
            mode,
        }))
    }

    pub fn mode(&self) -> HackcMode {
        self.mode
    }

    /// Compile through the pool. In `Fatal` mode an error becomes a
    /// synthetic fatal unit; in `Fallback` mode it becomes `None` and the
    /// caller compiles in-process instead.
    pub fn compile(&self, callbacks: Option<&mut dyn AsmCallbacks>) -> Result<Option<UnitEmitter>> {
        match manager::compile(self.code, self.filename, &self.md5, callbacks)? {
            CompileResult::Unit(unit) => Ok(Some(unit)),
            CompileResult::Error(message) => match self.mode {
                HackcMode::Fatal => {
                    let assembler = manager::global().assembler().ok_or_else(|| {
                        CompilerError::BadCompiler("no assembler registered".into())
                    })?;
                    Ok(Some(assembler.fatal_unit(self.filename, &self.md5, &message)))
                }
                HackcMode::Fallback | HackcMode::Never => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hack_file() {
        assert!(is_hack_file(b"<?hh echo 1;"));
        assert!(is_hack_file(b"#!/usr/bin/env hhvm\n<?hh echo 1;"));

        assert!(!is_hack_file(b"<?php echo 1;"));
        assert!(!is_hack_file(b"<?hh")); // Marker alone is not a file
        assert!(!is_hack_file(b"#!/usr/bin/env hhvm"));
        assert!(!is_hack_file(b""));
    }

    #[test]
    fn test_unit_emitter_downcast() {
        let unit = UnitEmitter::new(vec![1u8, 2, 3]);
        assert_eq!(unit.downcast_ref::<Vec<u8>>(), Some(&vec![1u8, 2, 3]));
        assert!(unit.downcast_ref::<String>().is_none());

        let unit = unit.downcast::<String>().unwrap_err();
        let bytes = unit.downcast::<Vec<u8>>().unwrap();
        assert_eq!(*bytes, vec![1u8, 2, 3]);
    }
}
