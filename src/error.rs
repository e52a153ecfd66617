// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use codec::{ConnectReturnCode, DecodeError, EncodeError, TopicError};

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer sent bytes that are impossible under the protocol. The
    /// connection is torn down when this surfaces.
    MalformedPacket,

    /// Broker rejected the requested protocol level.
    UnsupportedProtocolVersion,

    /// Broker rejected the client identifier.
    IdentifierRejected,

    /// Broker is up but the MQTT service is unavailable.
    ServerUnavailable,

    /// Username or password is malformed.
    BadUsernameOrPassword,

    /// Broker refused the credentials.
    NotAuthorized,

    /// Broker refused a subscription filter.
    SubscriptionFailed,

    /// Operation exceeded its deadline and retry budget.
    Timeout,

    /// Caller aborted the operation.
    Cancelled,

    /// A packet with this identifier is already in flight.
    DuplicatePacketId,

    /// Broker stopped answering ping requests.
    HeartbeatFailure,

    /// The transport terminated while the client was running, or the client
    /// is past its reconnect budget.
    TransportLoss,

    /// Packet exceeds the negotiated maximum size.
    PacketTooLarge,

    /// Topic name or filter failed validation.
    InvalidTopic,

    /// Client id failed validation.
    InvalidClientId,

    /// Packet could not be serialized.
    EncodeError,

    /// Error occurred while performing I/O.
    IoError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn transport_lost(message: &str) -> Self {
        Self::new(ErrorKind::TransportLoss, message)
    }

    pub(crate) fn timeout(message: &str) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Map a connect return code to the error surfaced to the caller.
    ///
    /// Must not be called with `Accepted`.
    pub(crate) fn from_return_code(code: ConnectReturnCode) -> Self {
        let kind = match code {
            ConnectReturnCode::UnacceptedProtocol => ErrorKind::UnsupportedProtocolVersion,
            ConnectReturnCode::IdentifierRejected => ErrorKind::IdentifierRejected,
            ConnectReturnCode::ServerUnavailable => ErrorKind::ServerUnavailable,
            ConnectReturnCode::MalformedUsernamePassword => ErrorKind::BadUsernameOrPassword,
            ConnectReturnCode::Unauthorized => ErrorKind::NotAuthorized,
            ConnectReturnCode::Accepted | ConnectReturnCode::Reserved => ErrorKind::MalformedPacket,
        };
        Self::from_string(kind, format!("broker refused connection: {code:?}"))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        let kind = match err {
            DecodeError::PacketTooLarge => ErrorKind::PacketTooLarge,
            _ => ErrorKind::MalformedPacket,
        };
        Self::from_string(kind, format!("{err:?}"))
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        let kind = match err {
            EncodeError::InvalidTopic => ErrorKind::InvalidTopic,
            EncodeError::InvalidClientId => ErrorKind::InvalidClientId,
            EncodeError::OversizePacket => ErrorKind::PacketTooLarge,
            _ => ErrorKind::EncodeError,
        };
        Self::from_string(kind, format!("{err:?}"))
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        Self::from_string(ErrorKind::InvalidTopic, format!("{err:?}"))
    }
}
