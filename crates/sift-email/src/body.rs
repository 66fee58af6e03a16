use crate::{extract_body_text, EmailError, FetchParts, MailboxSession};
use sift_core::{MessageRecord, PayloadCipher};
use sift_storage::Storage;
use std::sync::Arc;

/// Fetches message bodies on first use and keeps them sealed in storage.
#[derive(Clone)]
pub struct BodyLoader {
    storage: Storage,
    session: MailboxSession,
    cipher: Arc<dyn PayloadCipher>,
}

impl BodyLoader {
    pub fn new(storage: Storage, session: MailboxSession, cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            storage,
            session,
            cipher,
        }
    }

    pub async fn body_text(&self, record: &MessageRecord) -> Result<String, EmailError> {
        if let Some(sealed) = &record.body_sealed {
            return Ok(self.cipher.open_string(sealed)?);
        }

        let Some(uid) = record.uid else {
            tracing::debug!(message = %record.id, "body unavailable without a server identifier");
            return Ok(String::new());
        };

        let fetched = self
            .session
            .in_folder(&record.folder, move |client, _| {
                client.fetch(&[uid], FetchParts::Body)
            })
            .await?;
        let Some(raw) = fetched.into_iter().find_map(|item| item.body) else {
            tracing::warn!(message = %record.id, uid, "server returned no body");
            return Ok(String::new());
        };

        let text = extract_body_text(&raw)?;
        self.storage
            .store_body(record.id, &self.cipher.seal_str(&text)?)
            .await?;
        Ok(text)
    }
}
