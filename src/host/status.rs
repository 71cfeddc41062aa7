use nix::errno::Errno;

/// Failure codes produced by the host pipe and namespace layers. These model
/// the status surface of a host whose pipe API reports conditions like "no
/// instance available" or "pipe listening" rather than POSIX errnos; the
/// socket core maps them exactly once, at the call site, through
/// [`errno_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// All pipe instances are in use (variant one of three equivalent codes).
    InstanceNotAvailable,
    /// All pipe instances are in use (variant two).
    PipeNotAvailable,
    /// All pipe instances are in use (variant three).
    PipeBusy,
    /// The instance is listening but no client has connected yet.
    PipeListening,
    /// A client is already connected to the instance.
    PipeConnected,
    /// The instance was disconnected by its server side.
    PipeDisconnected,
    /// The other end is gone and the data is drained.
    PipeClosing,
    /// No message is queued (non-blocking read).
    PipeEmpty,
    /// The server handle was closed while an operation was pending.
    PipeBroken,
    /// The supplied buffer was too small for the queued message.
    BufferOverflow,
    /// A timed host wait expired.
    IoTimeout,
    /// The named object does not exist.
    ObjectNameNotFound,
    /// The named object already exists (create-exclusive collision).
    ObjectNameCollision,
    /// A path component of the name does not exist.
    ObjectPathNotFound,
    /// The host is out of instance or buffer resources.
    InsufficientResources,
    /// The operation is not valid for the object's state.
    InvalidDeviceRequest,
    /// A malformed argument reached the host layer.
    InvalidParameter,
    /// The owning task signalled the termination event.
    ThreadIsTerminating,
    /// A signal interrupted the wait.
    WaitSignaled,
}

impl HostStatus {
    /// Some error conditions on pipes have multiple status codes,
    /// unfortunately.
    pub fn no_instance_available(self) -> bool {
        matches!(
            self,
            HostStatus::InstanceNotAvailable
                | HostStatus::PipeNotAvailable
                | HostStatus::PipeBusy
        )
    }

    pub fn pipe_is_closing(self) -> bool {
        matches!(self, HostStatus::PipeClosing | HostStatus::PipeDisconnected)
    }
}

/// The single host-status to errno mapping. Callers that need a more specific
/// errno (e.g. `EADDRINUSE` for a name collision during `bind`) translate the
/// status themselves before falling back to this function.
pub fn errno_for(status: HostStatus) -> Errno {
    match status {
        HostStatus::InstanceNotAvailable
        | HostStatus::PipeNotAvailable
        | HostStatus::PipeBusy => Errno::EBUSY,
        HostStatus::PipeListening | HostStatus::PipeEmpty => Errno::EAGAIN,
        HostStatus::PipeConnected => Errno::EISCONN,
        HostStatus::PipeDisconnected
        | HostStatus::PipeClosing
        | HostStatus::PipeBroken => Errno::EPIPE,
        HostStatus::BufferOverflow => Errno::EMSGSIZE,
        HostStatus::IoTimeout => Errno::ETIMEDOUT,
        HostStatus::ObjectNameNotFound | HostStatus::ObjectPathNotFound => Errno::ENOENT,
        HostStatus::ObjectNameCollision => Errno::EEXIST,
        HostStatus::InsufficientResources => Errno::ENOBUFS,
        HostStatus::InvalidDeviceRequest => Errno::EIO,
        HostStatus::InvalidParameter => Errno::EINVAL,
        HostStatus::ThreadIsTerminating | HostStatus::WaitSignaled => Errno::EINTR,
    }
}

impl std::error::Error for HostStatus {}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_trio() {
        assert!(HostStatus::InstanceNotAvailable.no_instance_available());
        assert!(HostStatus::PipeNotAvailable.no_instance_available());
        assert!(HostStatus::PipeBusy.no_instance_available());
        assert!(!HostStatus::PipeListening.no_instance_available());
    }

    #[test]
    fn interruption_maps_to_eintr() {
        assert_eq!(errno_for(HostStatus::ThreadIsTerminating), Errno::EINTR);
        assert_eq!(errno_for(HostStatus::WaitSignaled), Errno::EINTR);
    }
}
