use bitflags::bitflags;

bitflags! {
    /// Which blocked callers an event may have unblocked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Available: u8 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
        const STATE = 0b00000100;
    }
}
