//! SMTP vocabulary shared by the session and its collaborators.

pub mod command;
pub mod line;
pub mod message;
pub mod reply;
pub mod status;

pub use self::{
    command::{ClientCommand, CommandRecord, Verb},
    message::{Header, Message, MimeState},
    reply::Reply,
    status::Status,
};
