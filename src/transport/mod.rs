mod udp;
pub(crate) use self::udp::UdpSender;

#[cfg(unix)]
mod uds;
#[cfg(unix)]
pub(crate) use self::uds::UdsSender;

mod pipe;
pub(crate) use self::pipe::NamedPipeSender;

/// The transport family a sender belongs to, used to label telemetry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TransportKind {
    Udp,
    #[cfg(unix)]
    UnixSocket,
    NamedPipe,
}

impl TransportKind {
    /// Returns the tag value used for the `client_transport` telemetry tag.
    pub const fn as_tag(self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            #[cfg(unix)]
            TransportKind::UnixSocket => "uds",
            TransportKind::NamedPipe => "named_pipe",
        }
    }
}

/// A best-effort sender for one outbound frame.
///
/// `send` returning `true` means the frame was handed to the OS, not that it was delivered.
/// Returning `false` means the frame was dropped; senders never propagate network errors to the
/// caller. Beyond the [`TransportKind`] label, the delivery worker cannot tell senders apart.
pub(crate) trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn send(&mut self, frame: &[u8]) -> bool;
}
