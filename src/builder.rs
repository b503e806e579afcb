//! Builder for configuring and creating the persistent-memory manager.

use crate::backend::{self, PlatformBackend};
use crate::carve::CarvingEngine;
use crate::error::Result;
use crate::memory::BookkeepingConfig;
use crate::pmem::Pmem;

/// Builder for creating a [`Pmem`].
///
/// # Example
///
/// ```rust
/// use pmemvm::{BookkeepingConfig, Pmem};
///
/// let pmem = Pmem::builder()
///     .bookkeeping(BookkeepingConfig {
///         page_desc_size: 64,
///         ..Default::default()
///     })
///     .build()?;
/// assert_eq!(pmem.backend_name(), "sim");
/// # Ok::<(), pmemvm::Error>(())
/// ```
#[derive(Default)]
pub struct PmemBuilder {
    backend: Option<Box<dyn PlatformBackend>>,
    bookkeeping: Option<BookkeepingConfig>,
}

impl PmemBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the platform reservation backend.
    ///
    /// Default: the simulated backend
    pub fn backend(mut self, backend: impl PlatformBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Set the bookkeeping layout.
    ///
    /// Default: 4 KiB frames, 32-byte page descriptors, 8-byte reverse-map entries
    pub fn bookkeeping(mut self, config: BookkeepingConfig) -> Self {
        self.bookkeeping = Some(config);
        self
    }

    /// Set only the frame size shift.
    pub fn page_shift(mut self, shift: u32) -> Self {
        let mut config = self.bookkeeping.unwrap_or_default();
        config.page_shift = shift;
        self.bookkeeping = Some(config);
        self
    }

    /// Build the manager.
    ///
    /// This validates the configuration and creates the backend.
    pub fn build(self) -> Result<Pmem> {
        let config = self.bookkeeping.unwrap_or_default();
        config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend::create(config),
        };

        Ok(Pmem::new(CarvingEngine::new(backend, config), config))
    }
}
