use crate::arch::Architecture;
use crate::bounds::StackBounds;

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Word-granular read access to a thread's stack.
///
/// Implementations return `None` for any address they cannot vouch for;
/// a `Some` must come from memory inside the thread's stack bounds.
pub trait StackMemory {
    fn read_word(&self, address: usize) -> Option<usize>;
}

/// The two words of a frame record, read at fixed offsets from a frame
/// address: the caller's frame address at `+0`, the return address at `+WORD_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub next: usize,
    pub return_address: usize,
}

pub fn is_aligned<A: Architecture>(address: usize) -> bool {
    address % A::FRAME_ALIGNMENT == 0
}

pub fn is_valid_frame<A: Architecture>(address: usize, bounds: StackBounds) -> bool {
    bounds.contains(address) && is_aligned::<A>(address)
}

pub fn read_frame<M: StackMemory + ?Sized>(memory: &M, address: usize) -> Option<FrameRecord> {
    let next = memory.read_word(address)?;
    let return_address = memory.read_word(address.checked_add(WORD_SIZE)?)?;
    Some(FrameRecord {
        next,
        return_address,
    })
}
