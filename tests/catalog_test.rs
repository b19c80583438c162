mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use agency_portal::model::Role;
use common::spawn_app;

#[tokio::test]
async fn templates_prefill_new_requests() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;
    let (_, client) = app.user("c@acme.test", Role::Client, Some(acme)).await;

    let (_, service) = app
        .post(
            "/api/services",
            &admin,
            json!({ "name": "Web design", "price_cents": 0, "billing_interval": "one_time" }),
        )
        .await;
    let (status, template) = app
        .post(
            "/api/templates",
            &admin,
            json!({
                "name": "Landing page",
                "title": "New landing page",
                "description": "Hero, features, pricing",
                "default_priority": "high",
                "service_id": service["id"]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{template}");
    let tid = template["id"].as_i64().unwrap();

    let (status, _) = app
        .post("/api/templates", &client, json!({ "name": "x", "title": "y" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, listed) = app.get("/api/templates", &client).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, req) = app
        .post("/api/requests", &client, json!({ "template_id": tid }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{req}");
    assert_eq!(req["title"], "New landing page");
    assert_eq!(req["description"], "Hero, features, pricing");
    assert_eq!(req["priority"], "high");
    assert_eq!(req["service_id"], service["id"]);
    assert_eq!(req["template_id"], tid);

    // explicit fields win over the template
    let (_, req) = app
        .post(
            "/api/requests",
            &client,
            json!({ "template_id": tid, "title": "Pricing page", "priority": "low" }),
        )
        .await;
    assert_eq!(req["title"], "Pricing page");
    assert_eq!(req["priority"], "low");
    assert_eq!(req["description"], "Hero, features, pricing");
    let request_id = req["id"].as_i64().unwrap();

    let (status, updated) = app
        .call(
            Method::PATCH,
            &format!("/api/templates/{tid}"),
            Some(&admin),
            Some(json!({ "default_priority": "urgent" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["default_priority"], "urgent");
    assert_eq!(updated["title"], "New landing page");

    let (status, _) = app
        .call(Method::DELETE, &format!("/api/templates/{tid}"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get(&format!("/api/templates/{tid}"), &admin).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, req) = app.get(&format!("/api/requests/{request_id}"), &client).await;
    assert!(req["template_id"].is_null());

    let (status, _) = app
        .post("/api/requests", &client, json!({ "template_id": tid }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn clients_only_see_active_services() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;
    let (_, client) = app.user("c@acme.test", Role::Client, Some(acme)).await;

    let mut ids = Vec::new();
    for name in ["Retainer", "Audit"] {
        let (status, service) = app
            .post(
                "/api/services",
                &admin,
                json!({ "name": name, "price_cents": 1000, "billing_interval": "monthly" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(service["id"].as_i64().unwrap());
    }
    let (status, retired) = app
        .call(Method::DELETE, &format!("/api/services/{}", ids[1]), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retired["active"], false);

    let (_, visible) = app.get("/api/services", &client).await;
    let names: Vec<_> = visible
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Retainer"]);
    let (_, all) = app.get("/api/services", &admin).await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (status, _) = app
        .post(&format!("/api/companies/{acme}/services"), &admin, json!({ "service_id": ids[1] }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn companies_with_open_work_cannot_be_deleted() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;

    let (_, capacity) = app.get(&format!("/api/companies/{acme}/capacity"), &admin).await;
    assert_eq!(capacity, json!({ "limit": 1, "active": 0, "available": 1 }));

    let (_, req) = app
        .post("/api/requests", &admin, json!({ "company_id": acme, "title": "Logo" }))
        .await;
    let mv = format!("/api/requests/{}/move", req["id"]);
    app.post(&mv, &admin, json!({ "status": "active" })).await;

    let (_, capacity) = app.get(&format!("/api/companies/{acme}/capacity"), &admin).await;
    assert_eq!(capacity, json!({ "limit": 1, "active": 1, "available": 0 }));

    let (status, body) = app
        .call(Method::DELETE, &format!("/api/companies/{acme}"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    for status in ["review", "done"] {
        let (code, _) = app.post(&mv, &admin, json!({ "status": status })).await;
        assert_eq!(code, StatusCode::OK);
    }
    let (status, _) = app
        .call(Method::DELETE, &format!("/api/companies/{acme}"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get(&format!("/api/companies/{acme}"), &admin).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn marking_a_primary_contact_demotes_the_others() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;
    let other = app.company(&admin, "Globex").await;
    let contacts = format!("/api/companies/{acme}/contacts");

    let (status, dana) = app
        .post(
            &contacts,
            &admin,
            json!({ "name": "Dana", "email": "dana@acme.test", "is_primary": true }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, eli) = app
        .post(&contacts, &admin, json!({ "name": "Eli", "email": "eli@acme.test" }))
        .await;
    let (_, hank) = app
        .post(
            &format!("/api/companies/{other}/contacts"),
            &admin,
            json!({ "name": "Hank", "email": "hank@globex.test", "is_primary": true }),
        )
        .await;

    let (status, promoted) = app
        .call(
            Method::PATCH,
            &format!("/api/contacts/{}", eli["id"]),
            Some(&admin),
            Some(json!({ "is_primary": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["is_primary"], true);

    let (_, listed) = app.get(&contacts, &admin).await;
    let listed = listed.as_array().unwrap().clone();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], eli["id"]);
    assert_eq!(listed[0]["is_primary"], true);
    assert_eq!(listed[1]["id"], dana["id"]);
    assert_eq!(listed[1]["is_primary"], false);

    // other companies keep their primary contact
    let (_, globex) = app.get(&format!("/api/companies/{other}/contacts"), &admin).await;
    assert_eq!(globex[0]["id"], hank["id"]);
    assert_eq!(globex[0]["is_primary"], true);
}

#[tokio::test]
async fn stats_count_requests_by_status() {
    let app = spawn_app().await;
    let (_, admin) = app.admin().await;
    let acme = app.company(&admin, "Acme").await;
    let globex = app.company(&admin, "Globex").await;
    let (_, client) = app.user("c@acme.test", Role::Client, Some(acme)).await;

    for title in ["Logo", "Flyer"] {
        app.post("/api/requests", &admin, json!({ "company_id": acme, "title": title }))
            .await;
    }
    let (_, req) = app
        .post("/api/requests", &admin, json!({ "company_id": globex, "title": "Site" }))
        .await;
    let mv = format!("/api/requests/{}/move", req["id"]);
    for status in ["active", "review", "done"] {
        app.post(&mv, &admin, json!({ "status": status })).await;
    }

    let (status, stats) = app.get("/api/stats", &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        stats["requests_by_status"],
        json!({ "active": 0, "done": 1, "queue": 2, "review": 0 })
    );
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["open_requests"], 2);
    let companies = stats["companies"].as_array().unwrap();
    assert_eq!(companies[0]["company_name"], "Acme");
    assert_eq!(companies[0]["open_requests"], 2);
    assert_eq!(companies[1]["company_name"], "Globex");
    assert_eq!(companies[1]["open_requests"], 0);

    let (status, _) = app.get("/api/stats", &client).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
