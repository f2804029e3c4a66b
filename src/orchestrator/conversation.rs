//! Conversation persistence. Concurrent messages from the same sender
//! serialize on the conversation row via SELECT ... FOR UPDATE.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{
    audit_logs, conversations, message_logs, Channel, Conversation, MessageDirection, MessageLog,
    NewAuditLog, NewConversation, NewMessageLog,
};
use crate::shared::utils::DbPool;

pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert the conversation for `(channel_id, sender)` and append the
    /// inbound message log in the same transaction.
    pub fn upsert_with_inbound(
        &self,
        channel: &Channel,
        sender_id: &str,
        content: &str,
        metadata: serde_json::Value,
        correlation_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> AppResult<(Conversation, MessageLog)> {
        let mut conn = self.pool.get()?;
        let result = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let existing: Option<Conversation> = conversations::table
                .filter(conversations::channel_id.eq(channel.id))
                .filter(conversations::external_sender_id.eq(sender_id))
                .for_update()
                .first(conn)
                .optional()?;

            let conversation = match existing {
                Some(row) => row,
                None => {
                    let fresh = NewConversation {
                        id: Uuid::new_v4(),
                        tenant_id: channel.tenant_id,
                        brand_id: channel.brand_id,
                        channel_id: channel.id,
                        external_sender_id: sender_id.to_string(),
                        last_message_at: occurred_at,
                    };
                    // A concurrent insert may win the race; the conflict
                    // target makes this a no-op and the locked re-read
                    // returns whichever row landed.
                    diesel::insert_into(conversations::table)
                        .values(&fresh)
                        .on_conflict((
                            conversations::channel_id,
                            conversations::external_sender_id,
                        ))
                        .do_nothing()
                        .execute(conn)?;
                    conversations::table
                        .filter(conversations::channel_id.eq(channel.id))
                        .filter(conversations::external_sender_id.eq(sender_id))
                        .for_update()
                        .first(conn)?
                }
            };

            let log = NewMessageLog {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                direction: MessageDirection::Inbound.as_str().to_string(),
                content: content.to_string(),
                metadata,
                correlation_id: correlation_id.to_string(),
            };
            let inserted: MessageLog = diesel::insert_into(message_logs::table)
                .values(&log)
                .get_result(conn)?;

            diesel::update(conversations::table.find(conversation.id))
                .set(conversations::last_message_at.eq(occurred_at))
                .execute(conn)?;

            Ok((conversation, inserted))
        })?;
        Ok(result)
    }

    /// Last `limit` transcript entries in chronological order.
    pub fn history(&self, conversation_id: Uuid, limit: usize) -> AppResult<Vec<MessageLog>> {
        let mut conn = self.pool.get()?;
        let mut rows: Vec<MessageLog> = message_logs::table
            .filter(message_logs::conversation_id.eq(conversation_id))
            .order(message_logs::created_at.desc())
            .limit(limit as i64)
            .load(&mut conn)?;
        rows.reverse();
        Ok(rows)
    }

    /// Persist the outbound reply: append the log, bump `last_message_at`,
    /// and write the audit row when the policy mandates one. One
    /// transaction, committed before publish.
    pub fn persist_outbound(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
        content: &str,
        metadata: serde_json::Value,
        correlation_id: &str,
        audit_action: Option<&str>,
    ) -> AppResult<MessageLog> {
        let mut conn = self.pool.get()?;
        let inserted = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let log = NewMessageLog {
                id: Uuid::new_v4(),
                conversation_id,
                direction: MessageDirection::Outbound.as_str().to_string(),
                content: content.to_string(),
                metadata: metadata.clone(),
                correlation_id: correlation_id.to_string(),
            };
            let inserted: MessageLog = diesel::insert_into(message_logs::table)
                .values(&log)
                .get_result(conn)?;

            diesel::update(conversations::table.find(conversation_id))
                .set(conversations::last_message_at.eq(Utc::now()))
                .execute(conn)?;

            if let Some(action) = audit_action {
                let audit = NewAuditLog {
                    id: Uuid::new_v4(),
                    tenant_id: Some(tenant_id),
                    actor: "orchestrator".to_string(),
                    action: action.to_string(),
                    metadata: serde_json::json!({
                        "conversation_id": conversation_id,
                        "message_id": inserted.id,
                    }),
                    correlation_id: Some(correlation_id.to_string()),
                };
                diesel::insert_into(audit_logs::table)
                    .values(&audit)
                    .execute(conn)?;
            }

            Ok(inserted)
        })?;
        Ok(inserted)
    }

    pub fn fetch(&self, conversation_id: Uuid, tenant_id: Uuid) -> AppResult<Conversation> {
        let mut conn = self.pool.get()?;
        let conversation: Option<Conversation> = conversations::table
            .find(conversation_id)
            .filter(conversations::tenant_id.eq(tenant_id))
            .first(&mut conn)
            .optional()?;
        conversation.ok_or_else(|| {
            AppError::NotFound(format!("conversation {} not found", conversation_id))
        })
    }
}
