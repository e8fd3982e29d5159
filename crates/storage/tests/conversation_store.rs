use murmur_storage::{
    ChatId, ConversationStore, DEFAULT_CHAT_TITLE, DERIVED_TITLE_MAX_CHARS, MessageRole,
    NewMessage, SqliteStorage,
};

async fn open_store() -> (tempfile::TempDir, SqliteStorage) {
    let directory = tempfile::tempdir().expect("temp dir");
    let path = directory.path().join("nested").join("chats.sqlite3");
    let store = SqliteStorage::open(path.to_str().expect("utf-8 path"))
        .await
        .expect("store opens");
    (directory, store)
}

#[tokio::test]
async fn append_makes_message_visible_and_advances_timestamp() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");

    let mut previous_updated_at = chat.updated_at_unix_ms;
    for content in ["one", "two", "three"] {
        let message = store
            .append_message(chat.id, NewMessage::user(content))
            .await
            .expect("append");
        let transcript = store.get_chat(chat.id).await.expect("transcript");

        assert!(transcript.find_message(message.id).is_some());
        assert!(transcript.chat.updated_at_unix_ms > previous_updated_at);
        assert_eq!(transcript.chat.updated_at_unix_ms, message.created_at_unix_ms);
        previous_updated_at = transcript.chat.updated_at_unix_ms;
    }
}

#[tokio::test]
async fn messages_come_back_in_creation_order() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");

    let user = store
        .append_message(chat.id, NewMessage::user("Hello"))
        .await
        .expect("user");
    let assistant = store
        .append_message(chat.id, NewMessage::assistant("Hi there"))
        .await
        .expect("assistant");

    assert!(user.created_at_unix_ms < assistant.created_at_unix_ms);
    assert_eq!((user.seq, assistant.seq), (1, 2));

    let transcript = store.get_chat(chat.id).await.expect("transcript");
    let roles = transcript
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        roles,
        vec![
            (MessageRole::User, "Hello"),
            (MessageRole::Assistant, "Hi there")
        ]
    );
}

#[tokio::test]
async fn first_user_message_names_the_chat_once() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");
    assert_eq!(chat.title, DEFAULT_CHAT_TITLE);

    let long = "x".repeat(DERIVED_TITLE_MAX_CHARS + 10);
    store
        .append_message(chat.id, NewMessage::user(long.clone()))
        .await
        .expect("first");
    store
        .append_message(chat.id, NewMessage::user("something else"))
        .await
        .expect("second");

    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert_eq!(
        transcript.chat.title,
        format!("{}...", "x".repeat(DERIVED_TITLE_MAX_CHARS))
    );
}

#[tokio::test]
async fn assistant_messages_never_name_the_chat() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");

    store
        .append_message(chat.id, NewMessage::assistant("Welcome!"))
        .await
        .expect("assistant");
    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert_eq!(transcript.chat.title, DEFAULT_CHAT_TITLE);

    store
        .append_message(chat.id, NewMessage::user("Hello"))
        .await
        .expect("user");
    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert_eq!(transcript.chat.title, "Hello");
}

#[tokio::test]
async fn renamed_chat_keeps_its_title_after_first_message() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");

    let renamed = store
        .rename_chat(chat.id, "  Travel plans ".to_string())
        .await
        .expect("rename");
    assert_eq!(renamed.title, "Travel plans");

    store
        .append_message(chat.id, NewMessage::user("Book a flight"))
        .await
        .expect("append");
    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert_eq!(transcript.chat.title, "Travel plans");
}

#[tokio::test]
async fn empty_content_is_rejected_without_touching_the_chat() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");

    let error = store
        .append_message(chat.id, NewMessage::assistant("   "))
        .await
        .expect_err("blank content");
    assert!(error.is_invalid_input());

    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert!(transcript.messages.is_empty());
    assert_eq!(transcript.chat.updated_at_unix_ms, chat.updated_at_unix_ms);
}

#[tokio::test]
async fn missing_chat_reports_not_found_everywhere() {
    let (_directory, store) = open_store().await;
    let missing = ChatId::generate();

    assert!(store.get_chat(missing).await.expect_err("get").is_not_found());
    assert!(
        store
            .append_message(missing, NewMessage::user("hi"))
            .await
            .expect_err("append")
            .is_not_found()
    );
    assert!(
        store
            .rename_chat(missing, "title".to_string())
            .await
            .expect_err("rename")
            .is_not_found()
    );
    assert!(store.delete_chat(missing).await.expect_err("delete").is_not_found());
}

#[tokio::test]
async fn delete_cascades_to_messages() {
    let (_directory, store) = open_store().await;
    let chat = store.create_chat().await.expect("chat");
    store
        .append_message(chat.id, NewMessage::user("Hello"))
        .await
        .expect("append");

    store.delete_chat(chat.id).await.expect("delete");

    assert!(store.get_chat(chat.id).await.expect_err("gone").is_not_found());
    let orphaned = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
        .bind(chat.id.to_string())
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(orphaned, 0);
    assert!(store.delete_chat(chat.id).await.expect_err("twice").is_not_found());
}

#[tokio::test]
async fn listing_is_newest_updated_first_with_preview() {
    let (_directory, store) = open_store().await;
    let older = store.create_chat().await.expect("older");
    let newer = store.create_chat().await.expect("newer");
    // Millisecond timestamps: make sure the append lands strictly after `newer`.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    store
        .append_message(older.id, NewMessage::user("bring me back to the top"))
        .await
        .expect("append");

    let summaries = store.list_chats().await.expect("list");
    let ids = summaries
        .iter()
        .map(|summary| summary.chat.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![older.id, newer.id]);
    assert_eq!(summaries[0].message_count, 1);
    assert_eq!(
        summaries[0].preview.as_deref(),
        Some("bring me back to the top")
    );
    assert_eq!(summaries[1].preview, None);
}

#[tokio::test]
async fn in_memory_store_survives_between_calls() {
    let store = SqliteStorage::open_in_memory().await.expect("memory store");
    let chat = store.create_chat().await.expect("chat");
    store
        .append_message(chat.id, NewMessage::user("still here"))
        .await
        .expect("append");

    let transcript = store.get_chat(chat.id).await.expect("transcript");
    assert_eq!(transcript.messages.len(), 1);
}
