//! End-to-end tests: the chat controller driving the HTTP completion client
//! against a mock endpoint.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use utf8path::Path;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use confab::chat::{ChatController, GenerationOutcome};
    use confab::store::{FileStore, KeyValueStore};
    use confab::{ClientConfig, CompletionClient, Role};

    fn sse_body(tokens: &[&str]) -> String {
        let mut body = String::new();
        for token in tokens {
            let chunk = json!({"choices": [{"delta": {"content": token}}]});
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    async fn mount_stream(server: &MockServer, tokens: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body(tokens), "text/event-stream"),
            )
            .mount(server)
            .await;
    }

    async fn mount_once(server: &MockServer, content: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(reply(content))
            .mount(server)
            .await;
    }

    fn backend(server: &MockServer) -> Arc<CompletionClient> {
        let config = ClientConfig::new()
            .with_base_url(server.uri())
            .with_api_key(Some("sk-test".to_string()));
        Arc::new(CompletionClient::new(config).unwrap())
    }

    async fn streamed_histories(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| serde_json::from_slice::<Value>(&request.body).unwrap())
            .filter(|body| body["stream"] == json!(true))
            .map(|body| body["messages"].clone())
            .collect()
    }

    #[tokio::test]
    async fn send_streams_reply_and_names_conversation() {
        let server = MockServer::start().await;
        mount_stream(&server, &["Hello", " there"]).await;
        mount_once(&server, "Greeting\nChat").await;

        let controller = ChatController::new(backend(&server));
        let outcome = controller.send("Hello").await.unwrap();
        let GenerationOutcome::Completed {
            conversation_id,
            fallback,
            ..
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(!fallback);

        controller.wait_for_titles().await;
        let conversation = controller.conversation(&conversation_id).unwrap();
        assert_eq!(conversation.name, "Greeting Chat");
        let contents: Vec<_> = conversation
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            contents,
            vec![(Role::User, "Hello"), (Role::Assistant, "Hello there")]
        );
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn failed_stream_falls_back_to_single_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;
        mount_once(&server, "Recovered").await;

        let controller = ChatController::new(backend(&server));
        let outcome = controller.send("Are you there?").await.unwrap();
        let GenerationOutcome::Completed {
            conversation_id,
            message_id,
            fallback,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(fallback);
        let conversation = controller.conversation(&conversation_id).unwrap();
        assert_eq!(conversation.message(&message_id).unwrap().content, "Recovered");
        controller.wait_for_titles().await;
    }

    #[tokio::test]
    async fn total_failure_commits_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let controller = ChatController::new(backend(&server));
        let err = controller.send("Hello?").await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn regenerate_resends_history_without_old_reply() {
        let server = MockServer::start().await;
        mount_stream(&server, &["Four"]).await;
        mount_once(&server, "Arithmetic").await;

        let controller = ChatController::new(backend(&server));
        controller.send("2+2?").await.unwrap();
        controller.wait_for_titles().await;
        let conversation = controller.current_conversation().unwrap();
        let old_reply = conversation.last_message().unwrap().id.clone();

        let outcome = controller.regenerate(&conversation.id).await.unwrap();
        let new_reply = outcome.committed_message().unwrap().clone();
        assert_ne!(new_reply, old_reply);

        let histories = streamed_histories(&server).await;
        assert_eq!(histories.len(), 2);
        assert_eq!(histories[1], json!([{"role": "user", "content": "2+2?"}]));

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert!(conversation.message(&old_reply).is_none());
    }

    #[tokio::test]
    async fn edit_discards_later_turns() {
        let server = MockServer::start().await;
        mount_stream(&server, &["ok"]).await;
        mount_once(&server, "Short chat").await;

        let controller = ChatController::new(backend(&server));
        controller.send("first").await.unwrap();
        controller.send("second").await.unwrap();
        controller.wait_for_titles().await;
        let first = controller.current_conversation().unwrap().messages[0]
            .id
            .clone();

        assert_eq!(controller.begin_edit(&first).as_deref(), Some("first"));
        controller
            .edit_and_regenerate(&first, "first, revised")
            .await
            .unwrap();

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].content, "first, revised");
        assert_eq!(conversation.messages[0].id, first);
        assert_eq!(controller.session().editing_message_id, None);

        let histories = streamed_histories(&server).await;
        assert_eq!(
            histories.last().unwrap(),
            &json!([{"role": "user", "content": "first, revised"}])
        );
    }

    #[tokio::test]
    async fn stop_before_any_token_keeps_only_the_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(&["too", " late"]), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let controller = ChatController::new(backend(&server));
        let stopper = async {
            while !controller.is_streaming() {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(controller.stop());
        };
        let (outcome, ()) = tokio::join!(controller.send("Tell me a story"), stopper);

        match outcome.unwrap() {
            GenerationOutcome::Interrupted { message_id, .. } => assert_eq!(message_id, None),
            other => panic!("unexpected outcome {other:?}"),
        }
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let server = MockServer::start().await;
        mount_stream(&server, &["Persisted"]).await;
        mount_once(&server, "Saved chat").await;

        let dir = tempfile::tempdir().unwrap();
        let root = Path::try_from(dir.path().to_path_buf()).unwrap();
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(root.clone()).unwrap());

        let conversation_id = {
            let controller = ChatController::load(backend(&server), Arc::clone(&kv));
            controller.send("Remember me").await.unwrap();
            controller.wait_for_titles().await;
            controller.current_conversation().unwrap().id
        };

        let kv: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(root).unwrap());
        let restored = ChatController::load(backend(&server), kv);
        assert_eq!(
            restored.session().current_conversation_id,
            Some(conversation_id.clone())
        );
        let conversation = restored.conversation(&conversation_id).unwrap();
        assert_eq!(conversation.name, "Saved chat");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].content, "Persisted");
        assert!(conversation.messages.iter().all(|m| !m.streaming));
        assert!(!restored.is_streaming());
    }
}
