//! Hardware backend interface
//!
//! The CPU reads the input process image before and writes the output
//! process image after every cycle. Peripheral accesses (`PEW`, `PAW`, ...)
//! bypass the process image and go straight to the backend.

/// A hardware backend attached to the CPU
pub trait Hardware {
    fn startup(&mut self) {}

    fn shutdown(&mut self) {}

    /// Fill the input process image
    fn read_inputs(&mut self, _inputs: &mut [u8]) {}

    /// Publish the output process image
    fn write_outputs(&mut self, _outputs: &[u8]) {}

    /// Direct peripheral read of `width` bits at byte `offset`.
    /// `None` if this backend does not handle the address.
    fn direct_read(&mut self, _width: u32, _offset: u32) -> Option<Vec<u8>> {
        None
    }

    /// Direct peripheral write. Returns false if not handled.
    fn direct_write(&mut self, _width: u32, _offset: u32, _data: &[u8]) -> bool {
        false
    }
}

/// Backend without any I/O
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHardware;

impl Hardware for NullHardware {}
