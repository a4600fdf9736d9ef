/// Frame serialization for outgoing messages.
///
/// Implementors write their framing and metadata into `buf` and may return a
/// borrowed tail that the sender writes after the buffered part, so large
/// numeric payloads go out without copying.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
