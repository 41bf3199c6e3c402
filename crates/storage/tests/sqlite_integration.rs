use chrono::Duration;
use qudrat_core::model::{
    Answer, BatchClaimOutcome, GenerationContext, NewSession, Question, QuestionDraft, QuestionId, Section,
    SessionId, SessionKind, SessionScores, SessionStatus, TimeSnapshot, Track, UserId,
};
use qudrat_core::time::fixed_now;
use storage::repository::{
    AnswerRepository, GenerationCompletion, GenerationLogRepository, GenerationStatus,
    NewGenerationLog, PriceBookEntry, PriceBookRepository, SessionRepository, StorageError,
};
use storage::sqlite::SqliteRepository;

async fn connect(name: &str) -> SqliteRepository {
    let repo = SqliteRepository::connect(&format!("sqlite:file:{name}?mode=memory&cache=shared"))
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

fn question(n: usize, section: Section) -> Question {
    QuestionDraft {
        id: Some(QuestionId::new(format!("q{n}"))),
        section: Some(section),
        topic: Some("analogy".into()),
        stem: format!("stem {n}"),
        choices: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        answer_index: 2,
        passage: (n % 2 == 0).then(|| "passage".to_string()),
        ..QuestionDraft::default()
    }
    .validate()
    .unwrap()
}

fn new_exam(user_id: UserId) -> NewSession {
    NewSession::new(
        user_id,
        SessionKind::Exam {
            track: Track::Scientific,
        },
        4,
        2,
        vec!["analogy".into()],
        fixed_now(),
        7_200,
    )
    .unwrap()
}

#[tokio::test]
async fn session_roundtrip_keeps_questions_and_lifecycle() {
    let repo = connect("memdb_session_roundtrip").await;
    let session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();
    assert_eq!(session.revision(), 0);

    let mut working = session.clone();
    let batch = vec![question(0, Section::Quantitative), question(1, Section::Verbal)];
    let context = GenerationContext::empty()
        .advance(0, batch.iter().map(Question::id))
        .unwrap();
    working.append_batch(0, batch.clone(), context).unwrap();
    working
        .pause(
            fixed_now() + Duration::seconds(90),
            TimeSnapshot {
                remaining_time_secs: Some(7_000),
                time_spent_secs: Some(90),
            },
        )
        .unwrap();
    let revision = repo.update_session(&working).await.unwrap();
    assert_eq!(revision, 1);

    let stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), SessionStatus::Paused);
    assert_eq!(stored.paused_at(), Some(fixed_now() + Duration::seconds(90)));
    assert_eq!(stored.remaining_time_secs(), Some(7_000));
    assert_eq!(stored.questions(), batch.as_slice());
    assert_eq!(stored.generated_batches(), 1);
    assert_eq!(stored.generation_context().last_batch_index(), 0);
    assert_eq!(stored.revision(), 1);
}

#[tokio::test]
async fn batch_claim_survives_a_reload_and_clears_on_append() {
    let repo = connect("memdb_batch_claim").await;
    let mut session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();

    let claimed_at = fixed_now() + Duration::seconds(5);
    let BatchClaimOutcome::Claimed(claim) = session.claim_next_batch(claimed_at, 120).unwrap()
    else {
        panic!("fresh session should be claimable");
    };
    session.mark_persisted(repo.update_session(&session).await.unwrap());

    let mut stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.pending_batch(), Some(claim));
    assert_eq!(
        stored.claim_next_batch(claimed_at, 120).unwrap(),
        BatchClaimOutcome::InFlight(claim)
    );

    let batch = vec![question(0, Section::Verbal), question(1, Section::Verbal)];
    let context = GenerationContext::empty()
        .advance(0, batch.iter().map(Question::id))
        .unwrap();
    stored.append_batch(0, batch, context).unwrap();
    repo.update_session(&stored).await.unwrap();

    let stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.pending_batch(), None);
    assert_eq!(stored.generated_batches(), 1);
}

#[tokio::test]
async fn stale_revision_is_a_conflict() {
    let repo = connect("memdb_session_conflict").await;
    let session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();

    let mut first = session.clone();
    first.pause(fixed_now(), TimeSnapshot::default()).unwrap();
    repo.update_session(&first).await.unwrap();

    let mut second = session.clone();
    second
        .complete(fixed_now(), SessionScores::default(), None)
        .unwrap();
    let err = repo.update_session(&second).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    let missing = new_exam(session.user_id()).into_session(SessionId::new(999));
    let err = repo.update_session(&missing).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound));
}

#[tokio::test]
async fn completed_session_keeps_scores() {
    let repo = connect("memdb_session_scores").await;
    let mut session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();
    let scores = SessionScores {
        verbal_score: 50,
        quantitative_score: 100,
        overall_score: 75,
        strengths: vec!["algebra".into()],
        weaknesses: vec!["analogy".into()],
        categories: Vec::new(),
    };
    session
        .complete(fixed_now() + Duration::minutes(30), scores.clone(), Some(1_800))
        .unwrap();
    repo.update_session(&session).await.unwrap();

    let stored = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), SessionStatus::Completed);
    assert_eq!(stored.scores(), Some(&scores));
    assert_eq!(stored.time_spent_secs(), 1_800);
    assert!(stored.paused_at().is_none());
}

#[tokio::test]
async fn answers_are_unique_per_question() {
    let repo = connect("memdb_answers_unique").await;
    let session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();

    let answer = Answer::from_persisted(session.id(), 0, 2, true, 12, fixed_now()).unwrap();
    repo.insert_answer(&answer).await.unwrap();
    let err = repo.insert_answer(&answer).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    let later = Answer::from_persisted(session.id(), 1, 0, false, 5, fixed_now()).unwrap();
    repo.insert_answer(&later).await.unwrap();

    let answers = repo.list_answers(session.id()).await.unwrap();
    assert_eq!(answers, vec![answer, later]);
}

#[tokio::test]
async fn answers_are_refused_once_the_session_is_completed() {
    let repo = connect("memdb_answers_closed").await;
    let mut session = repo.insert_session(&new_exam(UserId::random())).await.unwrap();
    session
        .complete(fixed_now(), SessionScores::default(), None)
        .unwrap();
    repo.update_session(&session).await.unwrap();

    let late = Answer::from_persisted(session.id(), 0, 2, true, 12, fixed_now()).unwrap();
    let err = repo.insert_answer(&late).await.unwrap_err();
    assert!(matches!(err, StorageError::SessionClosed));
    assert!(repo.list_answers(session.id()).await.unwrap().is_empty());

    let orphan = Answer::from_persisted(SessionId::new(999), 0, 2, true, 12, fixed_now()).unwrap();
    assert!(matches!(
        repo.insert_answer(&orphan).await.unwrap_err(),
        StorageError::SessionClosed
    ));
}

#[tokio::test]
async fn list_sessions_filters_by_user() {
    let repo = connect("memdb_list_sessions").await;
    let user = UserId::random();
    let first = repo.insert_session(&new_exam(user)).await.unwrap();
    let mut later = new_exam(user);
    later.started_at = fixed_now() + Duration::hours(1);
    let second = repo.insert_session(&later).await.unwrap();
    repo.insert_session(&new_exam(UserId::random())).await.unwrap();

    let listed = repo.list_sessions_for_user(user, 10).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![second.id(), first.id()]);
}

#[tokio::test]
async fn generation_logs_track_cache_and_cost() {
    let repo = connect("memdb_generation_logs").await;
    let user = UserId::random();
    let session = repo.insert_session(&new_exam(user)).await.unwrap();

    let id = repo
        .insert_started(NewGenerationLog {
            session_id: session.id(),
            user_id: user,
            batch_index: 0,
            requested: 2,
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            started_at: fixed_now(),
        })
        .await
        .unwrap();
    repo.update_completion(
        id,
        GenerationCompletion {
            succeeded: true,
            duration_ms: 1_250,
            question_count: 2,
            prompt_tokens: Some(1_000),
            completion_tokens: Some(400),
            cached_tokens: Some(768),
            cache_hit: true,
            cost_micro_usd: Some(420),
            error: None,
        },
    )
    .await
    .unwrap();

    let logs = repo.list_for_session(session.id()).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Succeeded);
    assert!(logs[0].cache_hit);
    assert_eq!(logs[0].cached_tokens, Some(768));

    assert_eq!(repo.count_for_user_since(user, fixed_now()).await.unwrap(), 1);
    assert_eq!(
        repo.count_for_user_since(user, fixed_now() + Duration::seconds(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(repo.sum_cost_since(fixed_now()).await.unwrap(), 420);
    assert_eq!(
        repo.last_started_for_user(user).await.unwrap(),
        Some(fixed_now())
    );

    let err = repo
        .update_completion(id + 100, GenerationCompletion::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));
}

#[tokio::test]
async fn price_book_upserts() {
    let repo = connect("memdb_price_book").await;
    let mut entry = PriceBookEntry {
        provider: "openai".into(),
        model: "gpt-4o-mini".into(),
        input_micro_usd_per_million: 150_000,
        cached_input_micro_usd_per_million: 75_000,
        output_micro_usd_per_million: 600_000,
        deprecated: false,
    };
    repo.upsert_entry(&entry).await.unwrap();
    entry.deprecated = true;
    repo.upsert_entry(&entry).await.unwrap();

    let stored = repo.get_entry("openai", "gpt-4o-mini").await.unwrap();
    assert_eq!(stored, Some(entry));
    assert_eq!(repo.list_entries().await.unwrap().len(), 1);
    assert!(repo.get_entry("openai", "missing").await.unwrap().is_none());
}
