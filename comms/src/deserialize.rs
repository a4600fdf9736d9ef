use std::io;

/// Frame deserialization for incoming messages.
///
/// The returned value may borrow from `buf`, which holds exactly one frame.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
