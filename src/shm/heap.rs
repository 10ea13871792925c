//! In-process region backend

use std::sync::atomic::AtomicU64;

use super::SharedRegion;
use crate::error::{AppError, Result};

/// Heap-allocated region, zero-initialized.
///
/// Backed by `AtomicU64` words so that byte writes through the base pointer go
/// through interior mutability and the word view is always aligned.
#[derive(Debug)]
pub struct HeapRegion {
    name: String,
    len: usize,
    words: Box<[AtomicU64]>,
}

impl HeapRegion {
    pub fn new(name: impl Into<String>, len: usize) -> Result<Self> {
        let name = name.into();
        if len == 0 {
            return Err(AppError::shm(name, "region size must be non-zero"));
        }
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Ok(Self { name, len, words })
    }
}

impl SharedRegion for HeapRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}
