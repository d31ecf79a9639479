use bitflags::bitflags;

bitflags! {
    /// Readiness a fiber can wait for on a descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        /// Readable (`EPOLLIN`)
        const READ = 0x1;
        /// Writable (`EPOLLOUT`)
        const WRITE = 0x2;
    }
}

impl Event {
    /// No interest
    pub const NONE: Event = Event::empty();

    /// Epoll interest bits for these events
    pub(crate) fn to_epoll(self) -> u32 {
        let mut bits = 0;
        if self.contains(Event::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Event::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    /// Events reported by epoll. Errors and hangups wake both directions.
    pub(crate) fn from_epoll(bits: u32) -> Event {
        let mut event = Event::NONE;
        if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            return Event::READ | Event::WRITE;
        }
        if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
            event |= Event::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            event |= Event::WRITE;
        }
        event
    }

    /// Whether exactly one of READ/WRITE is set
    pub(crate) fn is_single(self) -> bool {
        self == Event::READ || self == Event::WRITE
    }
}
