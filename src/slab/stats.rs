/// Per size-class counters, stored in the shared region.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStat {
    /// Chunk capacity ever attached to the class.
    pub total: usize,
    /// Chunks currently handed out.
    pub used: usize,
    /// Allocation requests routed to the class.
    pub reqs: usize,
    /// Requests that found the pool exhausted.
    pub fails: usize,
}
