//! Cluster-wide state strings.
//!
//! These enums mirror the exact strings stored in the coordination store;
//! `Display`/`FromStr` round-trip through them. Unknown strings are kept as
//! errors rather than mapped to a default so stale or foreign writes are
//! surfaced by the callers.

use std::fmt;
use std::str::FromStr;

macro_rules! state_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $string:literal,)+ }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $string,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($string => Ok($name::$variant),)+
                    other => Err(format!(
                        concat!("invalid ", stringify!($name), " '{}'"), other
                    )),
                }
            }
        }
    };
}

state_enum! {
    /// Lifecycle state of a node daemon.
    DaemonState {
        Init => "init",
        Run => "run",
        Shutdown => "shutdown",
        Stop => "stop",
        Dead => "dead",
        Fenced => "fenced",
    }
}

state_enum! {
    /// Coordinator (router) state of a node.
    RouterState {
        Primary => "primary",
        Secondary => "secondary",
        Takeover => "takeover",
        Relinquish => "relinquish",
        None => "none",
    }
}

state_enum! {
    /// Domain-hosting state of a node.
    DomainState {
        Ready => "ready",
        Flush => "flush",
        Flushed => "flushed",
        Unflush => "unflush",
        FenceFlush => "fence-flush",
    }
}

state_enum! {
    /// Commanded state of a VM.
    VmState {
        Start => "start",
        Restart => "restart",
        Shutdown => "shutdown",
        Stop => "stop",
        Disable => "disable",
        Fail => "fail",
        Migrate => "migrate",
        Unmigrate => "unmigrate",
        Provision => "provision",
        Import => "import",
        Restore => "restore",
        Mirror => "mirror",
        Delete => "delete",
    }
}

impl VmState {
    /// States in which the owner is expected to have the domain running.
    pub fn expects_running(&self) -> bool {
        matches!(self, VmState::Start | VmState::Mirror)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            DomainState::Ready,
            DomainState::Flush,
            DomainState::Flushed,
            DomainState::Unflush,
            DomainState::FenceFlush,
        ] {
            assert_eq!(state.as_str().parse::<DomainState>().unwrap(), state);
        }
        assert_eq!("fence-flush".parse::<DomainState>().unwrap(), DomainState::FenceFlush);
        assert!("bogus".parse::<DaemonState>().is_err());
    }

    #[test]
    fn test_mirror_expects_running() {
        assert!(VmState::Mirror.expects_running());
        assert!(VmState::Start.expects_running());
        assert!(!VmState::Stop.expects_running());
    }
}
