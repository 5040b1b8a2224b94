//! Store and end-to-end scenarios against live payment/principal
//! databases.
//!
//! These are `#[ignore]`d by default; run them explicitly with
//! `PAYMENT_DATABASE_URL` and `PRINCIPAL_DATABASE_URL` pointing at two
//! distinct databases (each carries its own migration history):
//!
//! ```text
//! cargo test -- --ignored
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use paymentd_rs::config::Config;
use paymentd_rs::context::{DbAccess, ServiceContext};
use paymentd_rs::drivers::fritzpay::{sql as fritzpay_sql, FritzpayDriver};
use paymentd_rs::drivers::{Driver, InitPaymentOutcome};
use paymentd_rs::models::{
    Payment, PaymentConfig, PaymentMethod, PaymentMethodStatus, PaymentStatus,
};
use paymentd_rs::repos::{payment_method_repo, payment_repo};
use paymentd_rs::services::notifier::Notification;
use paymentd_rs::services::payment_service::PaymentService;
use paymentd_rs::PaymentError;

const TEST_SECRET: &str = "test-project-secret";

struct TestEnv {
    _shutdown: watch::Sender<bool>,
    ctx: Arc<ServiceContext>,
    service: Arc<PaymentService>,
    project_id: i64,
    project_key: String,
}

async fn setup() -> TestEnv {
    dotenvy::dotenv().ok();

    let payment_url =
        std::env::var("PAYMENT_DATABASE_URL").expect("PAYMENT_DATABASE_URL must be set for tests");
    let principal_url = std::env::var("PRINCIPAL_DATABASE_URL")
        .expect("PRINCIPAL_DATABASE_URL must be set for tests");

    let payment_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&payment_url)
        .await
        .expect("Failed to connect to payment database");
    let principal_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&principal_url)
        .await
        .expect("Failed to connect to principal database");

    paymentd_rs::db::run_payment_migrations(&payment_pool)
        .await
        .expect("payment migrations");
    paymentd_rs::db::run_principal_migrations(&principal_pool)
        .await
        .expect("principal migrations");

    let (project_id, project_key) = seed_project(&principal_pool).await;

    let config = Config {
        payment_database_url: payment_url,
        payment_database_ro_url: None,
        principal_database_url: principal_url,
        principal_database_ro_url: None,
        host: "127.0.0.1".to_string(),
        port: 0,
        public_base_url: "http://localhost:8080".to_string(),
        payment_id_enc_prime: 982450871,
        payment_id_enc_xor: 911,
        intent_timeout_ms: 500,
        commit_intent_timeout_secs: 60,
        auth_timestamp_skew_secs: 300,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(
        ServiceContext::new(
            config,
            payment_pool,
            None,
            principal_pool,
            None,
            shutdown_rx,
        )
        .expect("service context"),
    );
    let service = PaymentService::new(ctx.clone()).await.expect("service");

    TestEnv {
        _shutdown: shutdown_tx,
        ctx,
        service,
        project_id,
        project_key,
    }
}

async fn seed_project(principal_pool: &PgPool) -> (i64, String) {
    let suffix = Uuid::new_v4().simple().to_string();

    let principal_id: (i64,) = sqlx::query_as(
        "INSERT INTO principal (created, created_by, name) VALUES (NOW(), 'test', $1) RETURNING id",
    )
    .bind(format!("principal-{}", suffix))
    .fetch_one(principal_pool)
    .await
    .expect("insert principal");

    let project_id: (i64,) = sqlx::query_as(
        "INSERT INTO project (principal_id, created, created_by, name) \
         VALUES ($1, NOW(), 'test', $2) RETURNING id",
    )
    .bind(principal_id.0)
    .bind(format!("project-{}", suffix))
    .fetch_one(principal_pool)
    .await
    .expect("insert project");

    let key = format!("key-{}", suffix);
    sqlx::query(
        "INSERT INTO project_key (key, project_id, created, created_by, secret, active) \
         VALUES ($1, $2, NOW(), 'test', $3, TRUE)",
    )
    .bind(&key)
    .bind(project_id.0)
    .bind(TEST_SECRET)
    .execute(principal_pool)
    .await
    .expect("insert project key");

    (project_id.0, key)
}

/// Insert an active fritzpay payment method for the project
async fn seed_active_method(env: &TestEnv) -> PaymentMethod {
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let mut method = PaymentMethod {
        id: 0,
        project_id: env.project_id,
        provider_name: "fritzpay".to_string(),
        method_key: format!("method-{}", Uuid::new_v4().simple()),
        created: Utc::now(),
        created_by: "test".to_string(),
        status: PaymentMethodStatus::Draft,
        metadata: None,
    };
    payment_method_repo::insert_payment_method_tx(&mut tx, &mut method)
        .await
        .expect("insert method");
    method.status = PaymentMethodStatus::Active;
    payment_method_repo::insert_payment_method_status_tx(&mut tx, &method)
        .await
        .expect("insert method status");
    tx.commit().await.expect("commit");
    method
}

async fn set_method_status(env: &TestEnv, method: &mut PaymentMethod, status: PaymentMethodStatus) {
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    method.status = status;
    payment_method_repo::insert_payment_method_status_tx(&mut tx, method)
        .await
        .expect("insert method status");
    tx.commit().await.expect("commit");
}

fn payment_template(env: &TestEnv, method: &PaymentMethod) -> Payment {
    Payment {
        project_id: env.project_id,
        id: 0,
        created: Utc::now(),
        ident: format!("ord-{}", Uuid::new_v4().simple()),
        amount: 1000,
        subunits: 2,
        currency: "EUR".to_string(),
        config: PaymentConfig {
            payment_method_id: Some(method.id),
            country: Some("DE".to_string()),
            locale: Some("en-US".to_string()),
            ..Default::default()
        },
        metadata: None,
        status: None,
    }
}

async fn create_payment(env: &TestEnv, payment: &mut Payment) {
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    env.service
        .create_payment(&mut tx, payment)
        .await
        .expect("create payment");
    tx.commit().await.expect("commit");
}

/// Reload through the store so derived status reflects the log
async fn reload(env: &TestEnv, payment: &Payment) -> Payment {
    payment_repo::payment_by_id(
        env.ctx.payment_db(DbAccess::ReadOnly),
        payment.payment_id(),
    )
    .await
    .expect("load payment")
    .expect("payment exists")
}

async fn persist_intent(
    env: &TestEnv,
    payment: &Payment,
    intent: &str,
) -> paymentd_rs::services::intent::CommitIntent {
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let locked = env
        .service
        .payment_by_id_for_update(&mut tx, payment.payment_id())
        .await
        .expect("lock payment");
    let timeout = Duration::from_millis(500);
    let (mut payment_tx, commit) = match intent {
        "open" => env.service.intent_open(&locked, timeout).await,
        "paid" => env.service.intent_paid(&locked, timeout).await,
        "cancel" => env.service.intent_cancel(&locked, timeout).await,
        other => panic!("unknown intent {}", other),
    }
    .expect("intent");
    env.service
        .set_payment_transaction(&mut tx, &mut payment_tx)
        .await
        .expect("persist transaction");
    tx.commit().await.expect("commit");
    commit
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn current_status_follows_the_transaction_log() {
    let env = setup().await;
    let method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    // uninitialized payment has no current transaction
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let current = env
        .service
        .payment_transaction_current(&mut tx, &payment)
        .await;
    assert_eq!(current.err(), Some(PaymentError::TransactionNotFound));
    drop(tx);

    let commit = persist_intent(&env, &payment, "open").await;
    drop(commit);
    let reloaded = reload(&env, &payment).await;
    assert_eq!(reloaded.status, Some(PaymentStatus::Open));

    let commit = persist_intent(&env, &reloaded, "paid").await;
    drop(commit);
    let reloaded = reload(&env, &payment).await;
    assert_eq!(reloaded.status, Some(PaymentStatus::Paid));

    let mut tx = pool.begin().await.expect("begin");
    let current = env
        .service
        .payment_transaction_current(&mut tx, &payment)
        .await
        .expect("current");
    assert_eq!(current.status, PaymentStatus::Paid);
    assert_eq!(current.amount, 1000);
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn transaction_timestamps_stay_strictly_monotonic() {
    let env = setup().await;
    let method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");

    let mut first = payment.new_transaction(PaymentStatus::Open);
    first.amount = -payment.amount;
    env.service
        .set_payment_transaction(&mut tx, &mut first)
        .await
        .expect("first insert");

    // forged duplicate timestamp must be bumped, not rejected
    let mut second = payment.new_transaction(PaymentStatus::Paid);
    second.timestamp_ns = first.timestamp_ns;
    env.service
        .set_payment_transaction(&mut tx, &mut second)
        .await
        .expect("second insert");
    tx.commit().await.expect("commit");

    assert!(second.timestamp_ns > first.timestamp_ns);

    let reloaded = reload(&env, &payment).await;
    assert_eq!(reloaded.status, Some(PaymentStatus::Paid));
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn duplicate_ident_yields_exactly_one_payment() {
    let env = setup().await;
    let method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    let mut duplicate = payment_template(&env, &method);
    duplicate.ident = payment.ident.clone();

    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let result = env.service.create_payment(&mut tx, &mut duplicate).await;
    assert_eq!(result.err(), Some(PaymentError::DuplicateIdent));
    drop(tx);

    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM payment WHERE project_id = $1 AND ident = $2")
            .bind(env.project_id)
            .bind(&payment.ident)
            .fetch_one(pool)
            .await
            .expect("count");
    assert_eq!(count.0, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn pre_veto_leaves_the_payment_uninitialized() {
    use async_trait::async_trait;
    use paymentd_rs::services::intent::PreIntentWorker;

    struct RiskVeto;

    #[async_trait]
    impl PreIntentWorker for RiskVeto {
        async fn pre_intent(
            &self,
            _payment: Payment,
            _payment_tx: paymentd_rs::models::PaymentTransaction,
            _done: watch::Receiver<bool>,
            res: mpsc::Sender<PaymentError>,
        ) {
            let _ = res.send(PaymentError::IntentNotAllowed).await;
        }
    }

    let env = setup().await;
    env.service
        .register_pre_intent_worker(Arc::new(RiskVeto))
        .await;

    let method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    let result = env
        .service
        .intent_open(&payment, Duration::from_millis(500))
        .await;
    assert!(result.is_err(), "veto must abort the intent");

    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let current = env
        .service
        .payment_transaction_current(&mut tx, &payment)
        .await;
    assert_eq!(current.err(), Some(PaymentError::TransactionNotFound));
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn disabled_method_blocks_paid() {
    let env = setup().await;
    let mut method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    let commit = persist_intent(&env, &payment, "open").await;
    drop(commit);

    set_method_status(&env, &mut method, PaymentMethodStatus::Disabled).await;

    let reloaded = reload(&env, &payment).await;
    let result = env
        .service
        .intent_paid(&reloaded, Duration::from_millis(500))
        .await;
    assert_eq!(result.err(), Some(PaymentError::PaymentMethodDisabled));
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn payment_tokens_resolve_once_within_max_age() {
    let env = setup().await;
    let method = seed_active_method(&env).await;
    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;

    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    let token = env
        .service
        .create_payment_token(&mut tx, &payment)
        .await
        .expect("create token");
    tx.commit().await.expect("commit");

    let mut tx = pool.begin().await.expect("begin");
    let resolved = env
        .service
        .payment_by_token(&mut tx, &token.token)
        .await
        .expect("resolve token")
        .expect("token is live");
    assert_eq!(resolved.payment_id(), payment.payment_id());

    env.service
        .delete_payment_token(&mut tx, &token.token)
        .await
        .expect("delete token");
    tx.commit().await.expect("commit");

    let mut tx = pool.begin().await.expect("begin");
    let resolved = env
        .service
        .payment_by_token(&mut tx, &token.token)
        .await
        .expect("resolve token");
    assert!(resolved.is_none(), "deleted token must not resolve");
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn open_to_paid_emits_signed_notifications() {
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    #[derive(Clone)]
    struct Callbacks {
        bodies: Arc<Mutex<VecDeque<serde_json::Value>>>,
        notify: mpsc::Sender<()>,
    }

    async fn callback(
        State(state): State<Callbacks>,
        Json(body): Json<serde_json::Value>,
    ) -> &'static str {
        state.bodies.lock().expect("lock").push_back(body);
        let _ = state.notify.send(()).await;
        "OK"
    }

    let env = setup().await;
    let method = seed_active_method(&env).await;

    let (notify_tx, mut notify_rx) = mpsc::channel(4);
    let callbacks = Callbacks {
        bodies: Arc::new(Mutex::new(VecDeque::new())),
        notify: notify_tx,
    };
    let bodies = callbacks.bodies.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/cb", post(callback))
        .with_state(callbacks);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("callback server");
    });

    let mut payment = payment_template(&env, &method);
    payment.config.callback_url = Some(format!("http://{}/cb", addr));
    payment.config.callback_api_version = Some("2".to_string());
    payment.config.callback_project_key = Some(env.project_key.clone());
    create_payment(&env, &mut payment).await;

    // Open, persist, then fire commit: the notification reflects durable
    // state
    let commit = persist_intent(&env, &payment, "open").await;
    commit.commit();

    tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("notification within 2s");

    let body = bodies
        .lock()
        .expect("lock")
        .pop_front()
        .expect("one callback body");
    let notification: Notification = serde_json::from_value(body).expect("decode notification");
    assert_eq!(notification.status, PaymentStatus::Open);
    assert_eq!(notification.amount, -1000);
    assert!(notification.transaction_timestamp > 0);
    assert!(notification.verify(TEST_SECRET.as_bytes()));

    let reloaded = reload(&env, &payment).await;
    let commit = persist_intent(&env, &reloaded, "paid").await;
    commit.commit();

    tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("second notification within 2s");
    let body = bodies
        .lock()
        .expect("lock")
        .pop_front()
        .expect("second callback body");
    let notification: Notification = serde_json::from_value(body).expect("decode notification");
    assert_eq!(notification.status, PaymentStatus::Paid);
    assert_eq!(notification.amount, 1000);
    assert!(notification.verify(TEST_SECRET.as_bytes()));
}

#[tokio::test]
#[serial]
#[ignore = "requires payment and principal databases"]
async fn driver_init_is_idempotent() {
    use axum::Json;

    let env = setup().await;
    let method = seed_active_method(&env).await;

    // fake provider endpoint accepting the create_payment call
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = axum::Router::new().route(
        "/payments",
        axum::routing::post(|| async {
            Json(serde_json::json!({
                "id": "fp_123",
                "state": "created"
            }))
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("provider server");
    });

    // versioned driver config pointing at the fake provider
    let pool = env.ctx.payment_db(DbAccess::ReadWrite);
    let mut tx = pool.begin().await.expect("begin");
    fritzpay_sql::insert_config_tx(
        &mut tx,
        &fritzpay_sql::Config {
            project_id: env.project_id,
            method_key: method.method_key.clone(),
            created: Utc::now(),
            created_by: "test".to_string(),
            endpoint: format!("http://{}/payments", addr),
        },
    )
    .await
    .expect("insert driver config");
    tx.commit().await.expect("commit");

    let mut payment = payment_template(&env, &method);
    create_payment(&env, &mut payment).await;
    let payment = reload(&env, &payment).await;

    let driver = FritzpayDriver::new(env.ctx.clone(), env.service.clone());
    let first = driver
        .init_payment(&payment, &method)
        .await
        .expect("first init");
    assert!(matches!(first, InitPaymentOutcome::Initialized { .. }));

    // allow the detached provider call to land
    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = driver
        .init_payment(&payment, &method)
        .await
        .expect("second init");
    assert!(matches!(
        second,
        InitPaymentOutcome::AlreadyInitialized { .. }
    ));

    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM provider_fritzpay_transaction \
         WHERE project_id = $1 AND payment_id = $2 AND type = 'create_payment'",
    )
    .bind(env.project_id)
    .bind(payment.id)
    .fetch_one(pool)
    .await
    .expect("count");
    assert_eq!(count.0, 1, "exactly one create_payment row");
}
