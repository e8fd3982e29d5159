use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvalidInputSnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ChatId, MessageId};
use super::types::{
    ChatRecord, ChatSummary, ChatTranscript, DEFAULT_CHAT_TITLE, MessageRecord, MessageRole,
    NewMessage, derive_title, preview_text,
};
use super::{BoxFuture, ConversationStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection serializes every append transaction and
        // keeps `:memory:` databases alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "conversation store ready");

        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn list_chats_inner(&self) -> StorageResult<Vec<ChatSummary>> {
        let rows = sqlx::query_as::<_, ChatSummaryRow>(
            "SELECT c.id, c.title, c.created_at, c.updated_at, \
             (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id) AS message_count, \
             (SELECT m.content FROM messages m WHERE m.chat_id = c.id ORDER BY m.seq DESC LIMIT 1) AS preview \
             FROM chats c ORDER BY c.updated_at DESC, c.id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-list-query",
        })?;

        rows.into_iter().map(chat_summary_row_to_summary).collect()
    }

    async fn get_chat_inner(&self, chat_id: ChatId) -> StorageResult<ChatTranscript> {
        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "chat-get-acquire",
        })?;

        let chat = load_chat(&mut connection, chat_id, "chat-get-load").await?;
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, seq, role, content, created_at FROM messages WHERE chat_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(chat_id.to_string())
        .fetch_all(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-get-messages",
        })?;

        let messages = rows
            .into_iter()
            .map(message_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ChatTranscript { chat, messages })
    }

    async fn create_chat_inner(&self) -> StorageResult<ChatRecord> {
        let chat_id = ChatId::generate();
        let now = unix_timestamp_millis();

        sqlx::query("INSERT INTO chats (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(chat_id.to_string())
            .bind(DEFAULT_CHAT_TITLE)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-create-insert",
            })?;

        tracing::debug!(chat_id = %chat_id, "chat created");

        Ok(ChatRecord {
            id: chat_id,
            title: DEFAULT_CHAT_TITLE.to_string(),
            created_at_unix_ms: i64_to_u64(now, "chat-create-created-at")?,
            updated_at_unix_ms: i64_to_u64(now, "chat-create-updated-at")?,
        })
    }

    async fn append_message_inner(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        ensure!(
            !input.content.trim().is_empty(),
            InvalidInputSnafu {
                stage: "message-append-validate",
                details: "message content must not be empty".to_string(),
            }
        );

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-append-begin",
        })?;

        let chat = sqlx::query_as::<_, ChatRow>(
            "SELECT id, title, created_at, updated_at FROM chats WHERE id = ?",
        )
        .bind(chat_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-load-chat",
        })?
        .context(NotFoundSnafu {
            stage: "message-append-missing-chat",
            entity: "chat",
            id: chat_id.to_string(),
        })?;

        let next_seq = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?",
        )
        .bind(chat_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-next-seq",
        })?;

        let prior_user_messages = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ? AND role = 'user'",
        )
        .bind(chat_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-count-user",
        })?;

        // Wall clocks can stall or step back; the chat timestamp must still move forward.
        let now = unix_timestamp_millis().max(chat.updated_at.saturating_add(1));
        let message_id = MessageId::generate();

        sqlx::query(
            "INSERT INTO messages (id, chat_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(chat_id.to_string())
        .bind(next_seq)
        .bind(input.role.as_str())
        .bind(input.content.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        let derived_title = (input.role == MessageRole::User
            && prior_user_messages == 0
            && chat.title == DEFAULT_CHAT_TITLE)
            .then(|| derive_title(&input.content))
            .filter(|title| !title.is_empty());

        sqlx::query("UPDATE chats SET updated_at = ?, title = COALESCE(?, title) WHERE id = ?")
            .bind(now)
            .bind(derived_title.as_deref())
            .bind(chat_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-touch-chat",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-append-commit",
        })?;

        tracing::debug!(
            chat_id = %chat_id,
            message_id = %message_id,
            role = %input.role,
            seq = next_seq,
            retitled = derived_title.is_some(),
            "message appended"
        );

        Ok(MessageRecord {
            id: message_id,
            chat_id,
            seq: i64_to_u64(next_seq, "message-append-seq")?,
            role: input.role,
            content: input.content,
            created_at_unix_ms: i64_to_u64(now, "message-append-created-at")?,
        })
    }

    async fn rename_chat_inner(&self, chat_id: ChatId, title: String) -> StorageResult<ChatRecord> {
        let title = title.trim().to_string();
        ensure!(
            !title.is_empty(),
            InvalidInputSnafu {
                stage: "chat-rename-validate",
                details: "chat title must not be empty".to_string(),
            }
        );

        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "chat-rename-acquire",
        })?;

        let result = sqlx::query("UPDATE chats SET title = ? WHERE id = ?")
            .bind(title)
            .bind(chat_id.to_string())
            .execute(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-rename-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "chat-rename-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        load_chat(&mut connection, chat_id, "chat-rename-load").await
    }

    async fn delete_chat_inner(&self, chat_id: ChatId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-delete-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "chat-delete-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        tracing::debug!(chat_id = %chat_id, "chat deleted");
        Ok(())
    }
}

impl ConversationStore for SqliteStorage {
    fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatSummary>>> {
        Box::pin(self.list_chats_inner())
    }

    fn get_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<ChatTranscript>> {
        Box::pin(self.get_chat_inner(chat_id))
    }

    fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        Box::pin(self.create_chat_inner())
    }

    fn append_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(self.append_message_inner(chat_id, input))
    }

    fn rename_chat(
        &self,
        chat_id: ChatId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        Box::pin(self.rename_chat_inner(chat_id, title))
    }

    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.delete_chat_inner(chat_id))
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct ChatSummaryRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    message_count: i64,
    preview: Option<String>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::parse(&row.id)?,
        title: row.title,
        created_at_unix_ms: i64_to_u64(row.created_at, "chat-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn chat_summary_row_to_summary(row: ChatSummaryRow) -> StorageResult<ChatSummary> {
    let chat = chat_row_to_record(ChatRow {
        id: row.id,
        title: row.title,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })?;

    Ok(ChatSummary {
        chat,
        message_count: i64_to_u64(row.message_count, "chat-summary-message-count")?,
        preview: row.preview.as_deref().map(preview_text),
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn load_chat(
    connection: &mut SqliteConnection,
    chat_id: ChatId,
    stage: &'static str,
) -> StorageResult<ChatRecord> {
    let row = sqlx::query_as::<_, ChatRow>(
        "SELECT id, title, created_at, updated_at FROM chats WHERE id = ?",
    )
    .bind(chat_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?
    .context(NotFoundSnafu {
        stage,
        entity: "chat",
        id: chat_id.to_string(),
    })?;

    chat_row_to_record(row)
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
