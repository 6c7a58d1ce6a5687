//! cyberdeck-core: Shared protocol library for the cyberdeck terminal server.
//!
//! Provides the JSON frame types exchanged with the browser terminal, the
//! text codec and streaming UTF-8 decoder, session identifiers, and the
//! error type shared by the server.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame, Utf8ChunkDecoder};
pub use error::{DeckError, DeckResult};
pub use ids::{generate_session_id, is_valid_session_id, unix_now};
pub use messages::{ClientFrame, ServerFrame};
