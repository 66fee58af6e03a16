mod cipher;
mod model;
mod tags;

pub use cipher::{CipherError, PayloadCipher};
pub use model::*;
pub use tags::{Tag, TagService, TagServiceError};
