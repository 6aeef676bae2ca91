use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by sockets, the context, `poll` and the proxy
///
/// Three classes, which callers should treat differently:
///
/// - *Transient* ([`Error::WouldBlock`], [`Error::Interrupted`]): retry
///   the call.
/// - *Protocol* ([`Error::Fsm`], [`Error::HostUnreachable`],
///   [`Error::Fault`]): the caller or the peer is misusing the socket;
///   the state machine is left unchanged so the correct call can be
///   made next.
/// - *Fatal* ([`Error::Term`], [`Error::InvalidSocket`]): unrecoverable
///   for the affected handle.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The operation cannot complete right now; retry later or wait
    /// for readiness
    #[error("operation would block")]
    WouldBlock,

    /// The call does not fit the socket's state machine, e.g. two
    /// sends in a row on a strict REQ socket
    #[error("operation cannot be performed in the current state")]
    Fsm,

    /// ROUTER with the mandatory option set was asked to route to an
    /// identity with no attached pipe
    #[error("no route to peer")]
    HostUnreachable,

    /// A blocking call was interrupted before completing
    #[error("interrupted")]
    Interrupted,

    /// The owning context is terminating
    #[error("context was terminated")]
    Term,

    /// The socket handle is no longer usable
    #[error("invalid socket")]
    InvalidSocket,

    /// The option or operation is not supported by this socket type
    #[error("not supported")]
    Unsupported,

    /// Malformed argument, endpoint string or option value
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// A peer violated the wire protocol
    #[error("protocol fault")]
    Fault,

    /// The inproc endpoint name is already bound
    #[error("address in use")]
    AddrInUse,

    /// No socket is bound to the inproc endpoint
    #[error("connection refused")]
    ConnectionRefused,

    /// The context's socket limit was reached
    #[error("too many sockets")]
    SocketLimit,

    /// An OS-level call failed underneath the library
    #[error("I/O error: {0}")]
    Io(i32),
}

impl Error {
    /// Construct from the current OS error of a failed libc call
    #[cfg(unix)]
    pub(crate) fn last_os() -> Error {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINTR {
            Error::Interrupted
        } else {
            Error::Io(errno)
        }
    }
}
