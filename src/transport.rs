//! Reader transport abstraction
//!
//! The physical reader exposes a single active connection; the cipher for
//! sector authentication lives in the driver behind this trait. This crate
//! only orchestrates connect/authenticate/read sequencing.

use anyhow::Result;

/// Low-level tag transport, implemented by the reader driver
///
/// One connection at a time; sector operations are sequential within a
/// session. Implementations must be safe to call from one thread at a time.
pub trait TagTransport: Send + Sync {
    /// Open a session with the tag currently in the field
    fn connect(&self) -> Result<()>;

    /// Close the session; must be tolerant of being called when already closed
    fn disconnect(&self);

    /// Authenticate one sector with a 6-byte key. `false` means the key was
    /// rejected; errors are reserved for transport-level failures.
    fn authenticate(&self, sector: usize, key: &[u8; 6]) -> Result<bool>;

    /// Read one block by absolute index; `None` when the block is
    /// unreadable in the current authentication state
    fn read_block(&self, block: usize) -> Result<Option<[u8; 16]>>;
}

/// RAII session guard: disconnects on every exit path, including panics
/// and cancellation, so an abandoned scan never wedges the reader.
pub struct ConnectionGuard<'a> {
    transport: &'a dyn TagTransport,
}

impl<'a> ConnectionGuard<'a> {
    /// Connect and return a guard that disconnects on drop
    pub fn open(transport: &'a dyn TagTransport) -> Result<Self> {
        transport.connect()?;
        Ok(Self { transport })
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
