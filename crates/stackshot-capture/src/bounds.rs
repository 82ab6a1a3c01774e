/// Half-open address range `[low, high)` holding one thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackBounds {
    low: usize,
    high: usize,
}

impl StackBounds {
    /// Bounds that could not be determined. Nothing is contained in them.
    pub const INVALID: Self = Self { low: 0, high: 0 };

    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn len(&self) -> usize {
        self.high.saturating_sub(self.low)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        self.low < self.high
    }

    pub fn contains(&self, address: usize) -> bool {
        self.low <= address && address < self.high
    }

    /// Whether all of `[address, address + len)` lies inside the bounds.
    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => self.is_valid() && self.low <= address && end <= self.high,
            None => false,
        }
    }
}
