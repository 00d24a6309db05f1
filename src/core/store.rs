use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::CacheError;
use crate::core::ids::now_millis;
use crate::core::migrations;
use crate::core::models::{
    Conversation, Message, MessageStatus, OutgoingContent, PendingWrite, User,
};

type Reply<T> = oneshot::Sender<Result<T, CacheError>>;

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum CacheCmd {
    SchemaVersion {
        reply: Reply<u32>,
    },

    UpsertUser {
        user: User,
        reply: Reply<()>,
    },
    GetUser {
        id: String,
        reply: Reply<Option<User>>,
    },

    UpsertConversations {
        conversations: Vec<Conversation>,
        reply: Reply<()>,
    },
    ConversationsForUser {
        user_id: String,
        reply: Reply<Vec<Conversation>>,
    },
    GetConversation {
        id: String,
        reply: Reply<Option<Conversation>>,
    },
    ReplaceConversationsForUser {
        user_id: String,
        conversations: Vec<Conversation>,
        reply: Reply<Vec<Conversation>>,
    },
    DeleteConversation {
        id: String,
        reply: Reply<bool>,
    },
    DeleteAllConversations {
        reply: Reply<()>,
    },

    UpsertMessages {
        messages: Vec<Message>,
        reply: Reply<()>,
    },
    MessagesForConversation {
        conversation_id: String,
        reply: Reply<Vec<Message>>,
    },
    GetMessage {
        id: String,
        reply: Reply<Option<Message>>,
    },
    GetMessageByLocalId {
        local_id: String,
        reply: Reply<Option<Message>>,
    },
    ReplaceMessages {
        conversation_id: String,
        messages: Vec<Message>,
        reply: Reply<()>,
    },
    ReconcileMessages {
        conversation_id: String,
        snapshot: Vec<Message>,
        reply: Reply<Vec<Message>>,
    },
    UpdateMessageStatus {
        id: String,
        status: MessageStatus,
        reply: Reply<bool>,
    },
    SetLocalStatus {
        local_id: String,
        status: MessageStatus,
        reply: Reply<bool>,
    },
    DeleteMessagesForConversation {
        conversation_id: String,
        reply: Reply<usize>,
    },
    DeleteMessage {
        id: String,
        reply: Reply<bool>,
    },
    DeleteAllMessages {
        reply: Reply<()>,
    },

    StageOutgoing {
        message: Message,
        pending: Option<PendingWrite>,
        reply: Reply<()>,
    },
    EnqueuePending {
        pending: PendingWrite,
        reply: Reply<()>,
    },
    PendingEntries {
        include_parked: bool,
        reply: Reply<Vec<PendingWrite>>,
    },
    PendingForConversation {
        conversation_id: String,
        reply: Reply<Vec<PendingWrite>>,
    },
    GetPending {
        local_id: String,
        reply: Reply<Option<PendingWrite>>,
    },
    RecordDeliveryFailure {
        local_id: String,
        attempted_at: i64,
        error: String,
        reply: Reply<Option<u32>>,
    },
    ParkPending {
        local_id: String,
        reply: Reply<bool>,
    },
    UnparkPending {
        local_id: String,
        reply: Reply<bool>,
    },
    RemovePending {
        local_id: String,
        reply: Reply<bool>,
    },
    PendingCount {
        reply: Reply<u32>,
    },
    DeleteAllPending {
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// CacheHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

/// Async handle to the cache database. One background thread owns the
/// connection, so cache mutations never run in parallel.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<CacheCmd>,
}

impl CacheHandle {
    /// Open (or create) the cache database, migrate it and spawn the
    /// background thread.
    pub fn open(db_file: &Path) -> Result<Self, CacheError> {
        if let Some(dir) = db_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(db_file)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        log::debug!("Cache journal mode: {}", mode);
        log::info!("Opened cache database at {}", db_file.display());
        Self::spawn(conn)
    }

    /// A throwaway cache, mainly for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::spawn(Connection::open_in_memory()?)
    }

    fn spawn(mut conn: Connection) -> Result<Self, CacheError> {
        migrations::run(&mut conn)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("chatsync-cache".into())
            .spawn(move || Self::run_loop(conn, rx))?;

        Ok(CacheHandle { tx })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> CacheCmd,
    ) -> Result<T, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CacheError::Unavailable)?;
        rx.await.map_err(|_| CacheError::Unavailable)?
    }

    // -- async methods -------------------------------------------------------

    pub async fn schema_version(&self) -> Result<u32, CacheError> {
        self.request(|reply| CacheCmd::SchemaVersion { reply }).await
    }

    pub async fn upsert_user(&self, user: User) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::UpsertUser { user, reply })
            .await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::GetUser { id, reply }).await
    }

    pub async fn upsert_conversation(&self, conversation: Conversation) -> Result<(), CacheError> {
        self.bulk_upsert_conversations(vec![conversation]).await
    }

    /// Write all conversations in one transaction.
    pub async fn bulk_upsert_conversations(
        &self,
        conversations: Vec<Conversation>,
    ) -> Result<(), CacheError> {
        if conversations.is_empty() {
            return Ok(());
        }
        self.request(|reply| CacheCmd::UpsertConversations {
            conversations,
            reply,
        })
        .await
    }

    /// Conversations the user participates in, most recent activity first.
    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, CacheError> {
        let user_id = user_id.to_string();
        self.request(|reply| CacheCmd::ConversationsForUser { user_id, reply })
            .await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::GetConversation { id, reply })
            .await
    }

    /// Make the user's cached conversation list equal `conversations`.
    /// Returns the resulting list.
    pub async fn replace_conversations_for_user(
        &self,
        user_id: &str,
        conversations: Vec<Conversation>,
    ) -> Result<Vec<Conversation>, CacheError> {
        let user_id = user_id.to_string();
        self.request(|reply| CacheCmd::ReplaceConversationsForUser {
            user_id,
            conversations,
            reply,
        })
        .await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<bool, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::DeleteConversation { id, reply })
            .await
    }

    pub async fn delete_all_conversations(&self) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::DeleteAllConversations { reply })
            .await
    }

    pub async fn upsert_message(&self, message: Message) -> Result<(), CacheError> {
        self.bulk_upsert_messages(vec![message]).await
    }

    /// Write all messages in one transaction.
    pub async fn bulk_upsert_messages(&self, messages: Vec<Message>) -> Result<(), CacheError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.request(|reply| CacheCmd::UpsertMessages { messages, reply })
            .await
    }

    /// Messages of a conversation in ascending timestamp order.
    pub async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, CacheError> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| CacheCmd::MessagesForConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::GetMessage { id, reply }).await
    }

    /// Look up a message by its client correlation id, preferring the
    /// server-confirmed row.
    pub async fn get_message_by_local_id(
        &self,
        local_id: &str,
    ) -> Result<Option<Message>, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::GetMessageByLocalId { local_id, reply })
            .await
    }

    /// Atomically swap the conversation's messages for `messages`. On any
    /// failure the previous rows stay untouched.
    pub async fn replace_messages_for_conversation(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), CacheError> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| CacheCmd::ReplaceMessages {
            conversation_id,
            messages,
            reply,
        })
        .await
    }

    /// Replace the conversation with an authoritative snapshot, keeping
    /// optimistic rows the server has not echoed back yet. Returns the
    /// resulting message list.
    pub async fn reconcile_messages(
        &self,
        conversation_id: &str,
        snapshot: Vec<Message>,
    ) -> Result<Vec<Message>, CacheError> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| CacheCmd::ReconcileMessages {
            conversation_id,
            snapshot,
            reply,
        })
        .await
    }

    pub async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::UpdateMessageStatus { id, status, reply })
            .await
    }

    /// Set the status of the unconfirmed row correlated with `local_id`.
    /// Server-confirmed rows are left alone.
    pub async fn set_local_status(
        &self,
        local_id: &str,
        status: MessageStatus,
    ) -> Result<bool, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::SetLocalStatus {
            local_id,
            status,
            reply,
        })
        .await
    }

    pub async fn delete_messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<usize, CacheError> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| CacheCmd::DeleteMessagesForConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn delete_message(&self, id: &str) -> Result<bool, CacheError> {
        let id = id.to_string();
        self.request(|reply| CacheCmd::DeleteMessage { id, reply })
            .await
    }

    pub async fn delete_all_messages(&self) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::DeleteAllMessages { reply })
            .await
    }

    /// Write an optimistic message and, when given, its outbox entry in a
    /// single transaction.
    pub async fn stage_outgoing(
        &self,
        message: Message,
        pending: Option<PendingWrite>,
    ) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::StageOutgoing {
            message,
            pending,
            reply,
        })
        .await
    }

    /// Insert an outbox entry, or replace the payload of the entry with the
    /// same local id. Creation time and retry count of an existing entry are
    /// kept; the entry is unparked.
    pub async fn enqueue_pending(&self, pending: PendingWrite) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::EnqueuePending { pending, reply })
            .await
    }

    /// Drainable outbox entries, oldest first.
    pub async fn pending_entries(&self) -> Result<Vec<PendingWrite>, CacheError> {
        self.request(|reply| CacheCmd::PendingEntries {
            include_parked: false,
            reply,
        })
        .await
    }

    /// Every outbox entry including parked ones, oldest first.
    pub async fn all_pending(&self) -> Result<Vec<PendingWrite>, CacheError> {
        self.request(|reply| CacheCmd::PendingEntries {
            include_parked: true,
            reply,
        })
        .await
    }

    pub async fn pending_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PendingWrite>, CacheError> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| CacheCmd::PendingForConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn get_pending(&self, local_id: &str) -> Result<Option<PendingWrite>, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::GetPending { local_id, reply })
            .await
    }

    /// Bump the retry count after a failed delivery. Returns the new count,
    /// or `None` if the entry no longer exists.
    pub async fn record_delivery_failure(
        &self,
        local_id: &str,
        attempted_at: i64,
        error: &str,
    ) -> Result<Option<u32>, CacheError> {
        let local_id = local_id.to_string();
        let error = error.to_string();
        self.request(|reply| CacheCmd::RecordDeliveryFailure {
            local_id,
            attempted_at,
            error,
            reply,
        })
        .await
    }

    /// Exclude an entry from drains and mark its message `failed`.
    pub async fn park_pending(&self, local_id: &str) -> Result<bool, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::ParkPending { local_id, reply })
            .await
    }

    pub async fn unpark_pending(&self, local_id: &str) -> Result<bool, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::UnparkPending { local_id, reply })
            .await
    }

    pub async fn remove_pending(&self, local_id: &str) -> Result<bool, CacheError> {
        let local_id = local_id.to_string();
        self.request(|reply| CacheCmd::RemovePending { local_id, reply })
            .await
    }

    pub async fn pending_count(&self) -> Result<u32, CacheError> {
        self.request(|reply| CacheCmd::PendingCount { reply }).await
    }

    pub async fn delete_all_pending(&self) -> Result<(), CacheError> {
        self.request(|reply| CacheCmd::DeleteAllPending { reply })
            .await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<CacheCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                CacheCmd::SchemaVersion { reply } => {
                    let _ = reply.send(migrations::schema_version(&conn));
                }
                CacheCmd::UpsertUser { user, reply } => {
                    let _ = reply.send(Self::do_upsert_user(&conn, &user));
                }
                CacheCmd::GetUser { id, reply } => {
                    let _ = reply.send(Self::do_get_user(&conn, &id));
                }
                CacheCmd::UpsertConversations {
                    conversations,
                    reply,
                } => {
                    let _ = reply.send(Self::do_upsert_conversations(&conn, &conversations));
                }
                CacheCmd::ConversationsForUser { user_id, reply } => {
                    let _ = reply.send(Self::do_conversations_for_user(&conn, &user_id));
                }
                CacheCmd::GetConversation { id, reply } => {
                    let _ = reply.send(Self::do_get_conversation(&conn, &id));
                }
                CacheCmd::ReplaceConversationsForUser {
                    user_id,
                    conversations,
                    reply,
                } => {
                    let _ = reply.send(Self::do_replace_conversations_for_user(
                        &conn,
                        &user_id,
                        &conversations,
                    ));
                }
                CacheCmd::DeleteConversation { id, reply } => {
                    let _ = reply.send(Self::do_delete_where(
                        &conn,
                        "DELETE FROM conversations WHERE id = ?1",
                        &id,
                    ));
                }
                CacheCmd::DeleteAllConversations { reply } => {
                    let _ = reply.send(Self::do_clear(&conn, "DELETE FROM conversations"));
                }
                CacheCmd::UpsertMessages { messages, reply } => {
                    let _ = reply.send(Self::do_upsert_messages(&conn, &messages));
                }
                CacheCmd::MessagesForConversation {
                    conversation_id,
                    reply,
                } => {
                    let _ = reply.send(Self::do_messages_for_conversation(&conn, &conversation_id));
                }
                CacheCmd::GetMessage { id, reply } => {
                    let _ = reply.send(Self::do_get_message(&conn, &id));
                }
                CacheCmd::GetMessageByLocalId { local_id, reply } => {
                    let _ = reply.send(Self::do_get_message_by_local_id(&conn, &local_id));
                }
                CacheCmd::ReplaceMessages {
                    conversation_id,
                    messages,
                    reply,
                } => {
                    let _ = reply.send(Self::do_replace_messages(
                        &conn,
                        &conversation_id,
                        &messages,
                    ));
                }
                CacheCmd::ReconcileMessages {
                    conversation_id,
                    snapshot,
                    reply,
                } => {
                    let _ = reply.send(Self::do_reconcile_messages(
                        &conn,
                        &conversation_id,
                        &snapshot,
                    ));
                }
                CacheCmd::UpdateMessageStatus { id, status, reply } => {
                    let _ = reply.send(Self::do_update_message_status(&conn, &id, status));
                }
                CacheCmd::SetLocalStatus {
                    local_id,
                    status,
                    reply,
                } => {
                    let _ = reply.send(Self::do_set_local_status(&conn, &local_id, status));
                }
                CacheCmd::DeleteMessagesForConversation {
                    conversation_id,
                    reply,
                } => {
                    let _ = reply.send(
                        conn.execute(
                            "DELETE FROM messages WHERE conversation_id = ?1",
                            [&conversation_id],
                        )
                        .map_err(CacheError::from),
                    );
                }
                CacheCmd::DeleteMessage { id, reply } => {
                    let _ = reply.send(Self::do_delete_where(
                        &conn,
                        "DELETE FROM messages WHERE id = ?1",
                        &id,
                    ));
                }
                CacheCmd::DeleteAllMessages { reply } => {
                    let _ = reply.send(Self::do_clear(&conn, "DELETE FROM messages"));
                }
                CacheCmd::StageOutgoing {
                    message,
                    pending,
                    reply,
                } => {
                    let _ = reply.send(Self::do_stage_outgoing(&conn, &message, pending.as_ref()));
                }
                CacheCmd::EnqueuePending { pending, reply } => {
                    let _ = reply.send(Self::do_enqueue_pending(&conn, &pending));
                }
                CacheCmd::PendingEntries {
                    include_parked,
                    reply,
                } => {
                    let _ = reply.send(Self::do_pending_entries(&conn, include_parked));
                }
                CacheCmd::PendingForConversation {
                    conversation_id,
                    reply,
                } => {
                    let _ = reply.send(Self::do_pending_for_conversation(&conn, &conversation_id));
                }
                CacheCmd::GetPending { local_id, reply } => {
                    let _ = reply.send(Self::do_get_pending(&conn, &local_id));
                }
                CacheCmd::RecordDeliveryFailure {
                    local_id,
                    attempted_at,
                    error,
                    reply,
                } => {
                    let _ = reply.send(Self::do_record_delivery_failure(
                        &conn,
                        &local_id,
                        attempted_at,
                        &error,
                    ));
                }
                CacheCmd::ParkPending { local_id, reply } => {
                    let _ = reply.send(Self::do_park_pending(&conn, &local_id));
                }
                CacheCmd::UnparkPending { local_id, reply } => {
                    let _ = reply.send(Self::do_delete_where(
                        &conn,
                        "UPDATE pending_messages SET parked = 0 WHERE local_id = ?1",
                        &local_id,
                    ));
                }
                CacheCmd::RemovePending { local_id, reply } => {
                    let _ = reply.send(Self::do_delete_where(
                        &conn,
                        "DELETE FROM pending_messages WHERE local_id = ?1",
                        &local_id,
                    ));
                }
                CacheCmd::PendingCount { reply } => {
                    let _ = reply.send(
                        conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |row| {
                            row.get(0)
                        })
                        .map_err(CacheError::from),
                    );
                }
                CacheCmd::DeleteAllPending { reply } => {
                    let _ = reply.send(Self::do_clear(&conn, "DELETE FROM pending_messages"));
                }
            }
        }
        log::debug!("Cache thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    /// Run a single-key statement; true when it touched a row.
    fn do_delete_where(conn: &Connection, sql: &str, key: &str) -> Result<bool, CacheError> {
        Ok(conn.execute(sql, [key])? > 0)
    }

    fn do_clear(conn: &Connection, sql: &str) -> Result<(), CacheError> {
        conn.execute(sql, [])?;
        Ok(())
    }

    // -- users --

    fn do_upsert_user(conn: &Connection, user: &User) -> Result<(), CacheError> {
        conn.execute(
            "INSERT OR REPLACE INTO users
             (id, email, display_name, profile_picture_url, is_online, last_seen, push_token, created_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id,
                user.email,
                user.display_name,
                user.profile_picture_url,
                user.is_online as i32,
                user.last_seen,
                user.push_token,
                user.created_at,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    fn do_get_user(conn: &Connection, id: &str) -> Result<Option<User>, CacheError> {
        let user = conn
            .query_row(
                "SELECT id, email, display_name, profile_picture_url, is_online, last_seen, push_token, created_at
                 FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        profile_picture_url: row.get(3)?,
                        is_online: row.get::<_, i32>(4)? != 0,
                        last_seen: row.get(5)?,
                        push_token: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // -- conversations --

    const CONVERSATION_COLUMNS: &'static str = "id, type, name, participants, last_message, last_message_timestamp, group_picture_url, created_at, created_by";

    fn insert_conversation(conn: &Connection, c: &Conversation) -> Result<(), CacheError> {
        conn.execute(
            "INSERT OR REPLACE INTO conversations
             (id, type, name, participants, last_message, last_message_timestamp, group_picture_url, created_at, created_by, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                c.id,
                c.kind.as_str(),
                c.name,
                serde_json::to_string(&c.participants)?,
                c.last_message,
                c.last_message_timestamp,
                c.group_picture_url,
                c.created_at,
                c.created_by,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    fn read_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
        Ok(ConversationRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            participants: row.get(3)?,
            last_message: row.get(4)?,
            last_message_timestamp: row.get(5)?,
            group_picture_url: row.get(6)?,
            created_at: row.get(7)?,
            created_by: row.get(8)?,
        })
    }

    fn do_upsert_conversations(
        conn: &Connection,
        conversations: &[Conversation],
    ) -> Result<(), CacheError> {
        let tx = conn.unchecked_transaction()?;
        for c in conversations {
            Self::insert_conversation(&tx, c)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn do_conversations_for_user(
        conn: &Connection,
        user_id: &str,
    ) -> Result<Vec<Conversation>, CacheError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations
             WHERE EXISTS (SELECT 1 FROM json_each(conversations.participants) WHERE value = ?1)
             ORDER BY last_message_timestamp IS NULL, last_message_timestamp DESC, created_at DESC",
            Self::CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map([user_id], Self::read_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?.into_model()?);
        }
        Ok(conversations)
    }

    fn do_get_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, CacheError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE id = ?1",
                    Self::CONVERSATION_COLUMNS
                ),
                [id],
                Self::read_conversation,
            )
            .optional()?;
        row.map(ConversationRow::into_model).transpose()
    }

    fn do_replace_conversations_for_user(
        conn: &Connection,
        user_id: &str,
        conversations: &[Conversation],
    ) -> Result<Vec<Conversation>, CacheError> {
        let tx = conn.unchecked_transaction()?;

        // Write-through: the user's slice becomes exactly the snapshot
        tx.execute(
            "DELETE FROM conversations
             WHERE EXISTS (SELECT 1 FROM json_each(conversations.participants) WHERE value = ?1)",
            [user_id],
        )?;
        for c in conversations {
            Self::insert_conversation(&tx, c)?;
        }

        tx.commit()?;
        Self::do_conversations_for_user(conn, user_id)
    }

    // -- messages --

    const MESSAGE_COLUMNS: &'static str = "id, conversation_id, sender_id, type, content, image_url, timestamp, status, delivered_to, read_by, local_id";

    fn write_message(conn: &Connection, verb: &str, m: &Message) -> Result<(), CacheError> {
        conn.execute(
            &format!(
                "{verb} INTO messages
                 (id, conversation_id, sender_id, type, content, image_url, timestamp, status, delivered_to, read_by, local_id, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                m.id,
                m.conversation_id,
                m.sender_id,
                m.kind.as_str(),
                m.content,
                m.image_url,
                m.timestamp,
                m.status.as_str(),
                serde_json::to_string(&m.delivered_to)?,
                serde_json::to_string(&m.read_by)?,
                m.local_id,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    fn read_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            image_url: row.get(5)?,
            timestamp: row.get(6)?,
            status: row.get(7)?,
            delivered_to: row.get(8)?,
            read_by: row.get(9)?,
            local_id: row.get(10)?,
        })
    }

    fn do_upsert_messages(conn: &Connection, messages: &[Message]) -> Result<(), CacheError> {
        let tx = conn.unchecked_transaction()?;
        for m in messages {
            Self::write_message(&tx, "INSERT OR REPLACE", m)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn do_messages_for_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Vec<Message>, CacheError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC",
            Self::MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map([conversation_id], Self::read_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_model()?);
        }
        Ok(messages)
    }

    fn do_get_message(conn: &Connection, id: &str) -> Result<Option<Message>, CacheError> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", Self::MESSAGE_COLUMNS),
                [id],
                Self::read_message,
            )
            .optional()?;
        row.map(MessageRow::into_model).transpose()
    }

    fn do_get_message_by_local_id(
        conn: &Connection,
        local_id: &str,
    ) -> Result<Option<Message>, CacheError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages WHERE local_id = ?1
                     ORDER BY (id = local_id) ASC LIMIT 1",
                    Self::MESSAGE_COLUMNS
                ),
                [local_id],
                Self::read_message,
            )
            .optional()?;
        row.map(MessageRow::into_model).transpose()
    }

    fn check_conversation(conversation_id: &str, messages: &[Message]) -> Result<(), CacheError> {
        match messages.iter().find(|m| m.conversation_id != conversation_id) {
            Some(stray) => Err(CacheError::Constraint(format!(
                "message {} belongs to conversation {}, not {}",
                stray.id, stray.conversation_id, conversation_id
            ))),
            None => Ok(()),
        }
    }

    fn do_replace_messages(
        conn: &Connection,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        Self::check_conversation(conversation_id, messages)?;

        // Dropping an uncommitted transaction rolls it back
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        for m in messages {
            Self::write_message(&tx, "INSERT", m)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn do_reconcile_messages(
        conn: &Connection,
        conversation_id: &str,
        snapshot: &[Message],
    ) -> Result<Vec<Message>, CacheError> {
        Self::check_conversation(conversation_id, snapshot)?;

        let tx = conn.unchecked_transaction()?;

        let confirmed: HashSet<&str> = snapshot
            .iter()
            .flat_map(|m| std::iter::once(m.id.as_str()).chain(m.local_id.as_deref()))
            .collect();

        // Optimistic rows the server has not echoed back stay visible
        let mut keep = Vec::new();
        for m in Self::do_messages_for_conversation(&tx, conversation_id)? {
            if m.is_local_only() && !confirmed.contains(m.id.as_str()) {
                keep.push(m);
            }
        }

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        for m in snapshot.iter().chain(keep.iter()) {
            Self::write_message(&tx, "INSERT", m)?;
        }
        tx.commit()?;

        if !keep.is_empty() {
            log::debug!(
                "Reconciled {}: {} from server, {} still local",
                conversation_id,
                snapshot.len(),
                keep.len()
            );
        }
        Self::do_messages_for_conversation(conn, conversation_id)
    }

    fn do_update_message_status(
        conn: &Connection,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool, CacheError> {
        let n = conn.execute(
            "UPDATE messages SET status = ?1, synced_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_millis(), id],
        )?;
        Ok(n > 0)
    }

    fn do_set_local_status(
        conn: &Connection,
        local_id: &str,
        status: MessageStatus,
    ) -> Result<bool, CacheError> {
        let n = conn.execute(
            "UPDATE messages SET status = ?1
             WHERE local_id = ?2 AND id = local_id AND status IN ('sending', 'failed')",
            params![status.as_str(), local_id],
        )?;
        Ok(n > 0)
    }

    // -- outbox --

    const PENDING_COLUMNS: &'static str = "local_id, conversation_id, sender_id, type, content, image_url, created_at, retry_count, last_attempt_at, last_error, parked";

    fn read_pending(row: &Row<'_>) -> rusqlite::Result<PendingRow> {
        Ok(PendingRow {
            local_id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            image_url: row.get(5)?,
            created_at: row.get(6)?,
            retry_count: row.get(7)?,
            last_attempt_at: row.get(8)?,
            last_error: row.get(9)?,
            parked: row.get::<_, i32>(10)? != 0,
        })
    }

    fn do_enqueue_pending(conn: &Connection, p: &PendingWrite) -> Result<(), CacheError> {
        conn.execute(
            "INSERT INTO pending_messages
             (local_id, conversation_id, sender_id, type, content, image_url, created_at, retry_count, last_attempt_at, last_error, parked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(local_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                sender_id = excluded.sender_id,
                type = excluded.type,
                content = excluded.content,
                image_url = excluded.image_url,
                parked = 0",
            params![
                p.local_id,
                p.conversation_id,
                p.sender_id,
                p.content.kind().as_str(),
                p.content.text(),
                p.content.image_url(),
                p.created_at,
                p.retry_count,
                p.last_attempt_at,
                p.last_error,
                p.parked as i32,
            ],
        )?;
        Ok(())
    }

    fn do_stage_outgoing(
        conn: &Connection,
        message: &Message,
        pending: Option<&PendingWrite>,
    ) -> Result<(), CacheError> {
        let tx = conn.unchecked_transaction()?;
        Self::write_message(&tx, "INSERT OR REPLACE", message)?;
        if let Some(p) = pending {
            Self::do_enqueue_pending(&tx, p)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn collect_pending(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PendingWrite>, CacheError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, Self::read_pending)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_model()?);
        }
        Ok(entries)
    }

    fn do_pending_entries(
        conn: &Connection,
        include_parked: bool,
    ) -> Result<Vec<PendingWrite>, CacheError> {
        let filter = if include_parked { "" } else { "WHERE parked = 0" };
        Self::collect_pending(
            conn,
            &format!(
                "SELECT {} FROM pending_messages {filter} ORDER BY created_at ASC, rowid ASC",
                Self::PENDING_COLUMNS
            ),
            params![],
        )
    }

    fn do_pending_for_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Vec<PendingWrite>, CacheError> {
        Self::collect_pending(
            conn,
            &format!(
                "SELECT {} FROM pending_messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
                Self::PENDING_COLUMNS
            ),
            params![conversation_id],
        )
    }

    fn do_get_pending(conn: &Connection, local_id: &str) -> Result<Option<PendingWrite>, CacheError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_messages WHERE local_id = ?1",
                    Self::PENDING_COLUMNS
                ),
                [local_id],
                Self::read_pending,
            )
            .optional()?;
        row.map(PendingRow::into_model).transpose()
    }

    fn do_record_delivery_failure(
        conn: &Connection,
        local_id: &str,
        attempted_at: i64,
        error: &str,
    ) -> Result<Option<u32>, CacheError> {
        let n = conn.execute(
            "UPDATE pending_messages
             SET retry_count = retry_count + 1, last_attempt_at = ?1, last_error = ?2
             WHERE local_id = ?3",
            params![attempted_at, error, local_id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let count = conn.query_row(
            "SELECT retry_count FROM pending_messages WHERE local_id = ?1",
            [local_id],
            |row| row.get(0),
        )?;
        Ok(Some(count))
    }

    fn do_park_pending(conn: &Connection, local_id: &str) -> Result<bool, CacheError> {
        let tx = conn.unchecked_transaction()?;
        let n = tx.execute(
            "UPDATE pending_messages SET parked = 1 WHERE local_id = ?1",
            [local_id],
        )?;
        Self::do_set_local_status(&tx, local_id, MessageStatus::Failed)?;
        tx.commit()?;
        Ok(n > 0)
    }
}

// ---------------------------------------------------------------------------
// Raw rows → models
// ---------------------------------------------------------------------------

struct ConversationRow {
    id: String,
    kind: String,
    name: Option<String>,
    participants: String,
    last_message: Option<String>,
    last_message_timestamp: Option<i64>,
    group_picture_url: Option<String>,
    created_at: i64,
    created_by: String,
}

impl ConversationRow {
    fn into_model(self) -> Result<Conversation, CacheError> {
        Ok(Conversation {
            id: self.id,
            kind: self.kind.parse()?,
            name: self.name,
            participants: serde_json::from_str(&self.participants)?,
            last_message: self.last_message,
            last_message_timestamp: self.last_message_timestamp,
            group_picture_url: self.group_picture_url,
            created_at: self.created_at,
            created_by: self.created_by,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    kind: String,
    content: String,
    image_url: Option<String>,
    timestamp: i64,
    status: String,
    delivered_to: String,
    read_by: String,
    local_id: Option<String>,
}

impl MessageRow {
    fn into_model(self) -> Result<Message, CacheError> {
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind.parse()?,
            content: self.content,
            image_url: self.image_url,
            timestamp: self.timestamp,
            status: self.status.parse()?,
            delivered_to: serde_json::from_str::<BTreeSet<String>>(&self.delivered_to)?,
            read_by: serde_json::from_str::<BTreeSet<String>>(&self.read_by)?,
            local_id: self.local_id,
        })
    }
}

struct PendingRow {
    local_id: String,
    conversation_id: String,
    sender_id: String,
    kind: String,
    content: String,
    image_url: Option<String>,
    created_at: i64,
    retry_count: u32,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
    parked: bool,
}

impl PendingRow {
    fn into_model(self) -> Result<PendingWrite, CacheError> {
        Ok(PendingWrite {
            content: OutgoingContent::from_parts(self.kind.parse()?, self.content, self.image_url)?,
            local_id: self.local_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            created_at: self.created_at,
            retry_count: self.retry_count,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error,
            parked: self.parked,
        })
    }
}
