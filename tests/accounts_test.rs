mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use serde_json::json;

use agency_portal::db;
use common::spawn_app;

#[tokio::test]
async fn invitation_lifecycle() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;

    let (status, body) = app
        .post("/api/invitations", &admin, json!({ "email": "new@client.test", "role": "client" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "company_id");

    let (status, created) = app
        .post(
            "/api/invitations",
            &admin,
            json!({ "email": "New@Client.test", "role": "client", "company_id": acme }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["invitation"]["email"], "new@client.test");
    assert!(created["invitation"].get("token_hash").is_none());
    let invite_token = created["token"].as_str().unwrap().to_string();
    let invitation_id = created["invitation"]["id"].as_i64().unwrap();
    // invitation email waits in the outbox
    assert_eq!(db::outbox::count_remaining(&app.pool).await.unwrap(), 1);

    let (status, _) = app
        .post(
            "/api/invitations",
            &admin,
            json!({ "email": "new@client.test", "role": "client", "company_id": acme }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let accept = |token: &str| json!({ "token": token, "full_name": "Nina New" });
    let (status, _) = app
        .call(Method::POST, "/api/invitations/accept", None, Some(accept("ap_wrong")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, accepted) = app
        .call(Method::POST, "/api/invitations/accept", None, Some(accept(&invite_token)))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{accepted}");
    assert_eq!(accepted["user"]["role"], "client");
    assert_eq!(accepted["user"]["company_id"], acme);
    let api_token = accepted["token"].as_str().unwrap().to_string();

    let (status, me) = app.get("/api/me", &api_token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["user"]["full_name"], "Nina New");
    assert_eq!(me["company"]["name"], "Acme");

    let (status, _) = app
        .call(Method::POST, "/api/invitations/accept", None, Some(accept(&invite_token)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = app
        .call(Method::DELETE, &format!("/api/invitations/{invitation_id}"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, pending) = app.get("/api/invitations?status=pending", &admin).await;
    assert_eq!(pending.as_array().unwrap().len(), 0);
    let (_, done) = app.get("/api/invitations?status=accepted", &admin).await;
    assert_eq!(done.as_array().unwrap().len(), 1);

    // the account exists now
    let (status, _) = app
        .post(
            "/api/invitations",
            &admin,
            json!({ "email": "new@client.test", "role": "client", "company_id": acme }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn expired_invitations_cannot_be_accepted() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let (_, created) = app
        .post("/api/invitations", &admin, json!({ "email": "ops@agency.test", "role": "admin" }))
        .await;
    sqlx::query("UPDATE invitations SET expires_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::hours(1))
        .bind(created["invitation"]["id"].as_i64().unwrap())
        .execute(&app.pool)
        .await
        .unwrap();

    let (status, body) = app
        .call(
            Method::POST,
            "/api/invitations/accept",
            None,
            Some(json!({ "token": created["token"], "full_name": "Late Larry" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn rotating_a_token_revokes_the_old_one() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;

    let (status, body) = app.post("/api/me/token", &admin, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let fresh = body["token"].as_str().unwrap().to_string();
    assert_ne!(fresh, admin);

    let (status, _) = app.get("/api/me", &admin).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, me) = app.get("/api/me", &fresh).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["user"]["role"], "admin");
}

#[tokio::test]
async fn notifications_are_private_to_their_owner() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;
    let (_, client) = app
        .user("c@acme.test", agency_portal::model::Role::Client, Some(acme))
        .await;

    // a client request notifies the admins
    app.post("/api/requests", &client, json!({ "title": "Logo" })).await;
    let (_, list) = app.get("/api/notifications?unread=true", &admin).await;
    let list = list.as_array().unwrap().clone();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["kind"], "request_created");
    let id = list[0]["id"].as_i64().unwrap();

    let (status, _) = app
        .post(&format!("/api/notifications/{id}/read"), &client, json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, n) = app
        .post(&format!("/api/notifications/{id}/read"), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(n["read_at"].is_string());

    let (_, count) = app.get("/api/notifications/unread-count", &admin).await;
    assert_eq!(count["count"], 0);
    let (status, _) = app
        .call(Method::DELETE, &format!("/api/notifications/{id}"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
