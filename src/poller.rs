//! Level-triggered readiness multiplexing over `poll(2)`.
//!
//! A [`PollSet`] is rebuilt from scratch every time it is used. Descriptors
//! are identified by [`Token`] rather than by raw fd so a result can never be
//! confused with a descriptor that was closed and reused in the meantime.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::slots::Side;
use crate::sys::cvt;

/// What a registered descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Listener,
    Shutdown,
    Slot(usize, Side),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Which tokens came back readable or writable.
#[derive(Debug, Default, Clone)]
pub struct Readiness {
    readable: HashSet<Token>,
    writable: HashSet<Token>,
}

impl Readiness {
    #[must_use]
    pub fn is_readable(&self, token: Token) -> bool {
        self.readable.contains(&token)
    }

    #[must_use]
    pub fn is_writable(&self, token: Token) -> bool {
        self.writable.contains(&token)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }

    pub fn set_readable(&mut self, token: Token) {
        self.readable.insert(token);
    }

    pub fn set_writable(&mut self, token: Token) {
        self.writable.insert(token);
    }

    /// Use up write-readiness for `token`; returns whether it was set.
    pub fn take_writable(&mut self, token: Token) -> bool {
        self.writable.remove(&token)
    }

    /// Fold everything ready in `other` into `self`.
    pub fn merge(&mut self, other: &Readiness) {
        self.readable.extend(other.readable.iter().copied());
        self.writable.extend(other.writable.iter().copied());
    }
}

#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<Token, usize>,
}

impl PollSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
            tokens: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
        self.tokens.clear();
        self.index.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Add interest for `token`. Registering the same token again widens its interest.
    pub fn register(&mut self, token: Token, fd: RawFd, interest: Interest) {
        if let Some(&i) = self.index.get(&token) {
            self.fds[i].events |= interest.events();
            return;
        }
        self.index.insert(token, self.fds.len());
        self.tokens.push(token);
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
    }

    /// Interest currently registered for `token`.
    #[must_use]
    pub fn interest(&self, token: Token) -> Option<Interest> {
        let pfd = &self.fds[*self.index.get(&token)?];
        Some(Interest {
            read: pfd.events & libc::POLLIN != 0,
            write: pfd.events & libc::POLLOUT != 0,
        })
    }

    /// Wait for readiness. `None` blocks until something is ready,
    /// `Some(Duration::ZERO)` only takes a snapshot.
    ///
    /// Hang-ups and socket errors are reported as whatever interest was
    /// registered so the next read or write observes the failure.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX),
        };

        loop {
            let res = cvt(unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            });
            match res {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut ready = Readiness::default();
        for (pfd, &token) in self.fds.iter().zip(&self.tokens) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            if revents & libc::POLLNVAL != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("descriptor {} for {token:?} is not open", pfd.fd),
                ));
            }

            let failed = revents & (libc::POLLERR | libc::POLLHUP) != 0;
            if pfd.events & libc::POLLIN != 0 && (revents & libc::POLLIN != 0 || failed) {
                ready.set_readable(token);
            }
            if pfd.events & libc::POLLOUT != 0 && (revents & libc::POLLOUT != 0 || failed) {
                ready.set_writable(token);
            }
        }
        Ok(ready)
    }
}
