use shared::domain::{DirectPairKey, MessageScope, ThreadInsert};
use storage::Storage;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_for_one_pair_share_a_single_thread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path()
            .join("threads.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let storage = Storage::new(&database_url).await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");

    let mut handles = Vec::new();
    for i in 0..8 {
        let storage = storage.clone();
        let pair = if i % 2 == 0 {
            DirectPairKey::new(alice, bob)
        } else {
            DirectPairKey::new(bob, alice)
        };
        handles.push(tokio::spawn(async move {
            let outcome = storage.insert_direct_thread(pair).await.expect("insert");
            storage
                .insert_participants(outcome.thread_id(), &pair.members())
                .await
                .expect("participants");
            outcome
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("join"));
    }

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, ThreadInsert::Created(_)))
        .count();
    assert_eq!(created, 1);
    let thread = outcomes[0].thread_id();
    assert!(outcomes.iter().all(|o| o.thread_id() == thread));

    let threads = storage.list_threads_for_user(alice).await.expect("list");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].participants.len(), 2);

    storage
        .insert_message(MessageScope::Thread(thread), bob, "hi", None)
        .await
        .expect("dm");
    let page = storage
        .list_messages(MessageScope::Thread(thread), 50, 0)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
}
