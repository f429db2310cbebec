mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use common::{app, q};
use serde_json::{json, Value};
use tower::ServiceExt;

#[tokio::test]
async fn post_requires_json_content_type() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/people")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"name": "Ann"}"#))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(app.rows("person").await.is_empty());
}

#[tokio::test]
async fn post_creates_with_location() {
    let app = app();
    let (status, headers, body) = app
        .send(Method::POST, "/api/people", Some(json!({"name": "Ann", "birthday": "1990-05-01T00:00:00"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get(header::LOCATION).unwrap(), "/api/people/1");
    assert_eq!(body["id"], json!(1));
    assert_eq!(body["birthday"], json!("1990-05-01"));
    assert_eq!(body["pets"], json!([]));
    assert_eq!(app.rows("person").await.len(), 1);
}

#[tokio::test]
async fn post_rejects_unknown_fields_and_bad_json() {
    let app = app();
    let (status, _, body) = app.send(Method::POST, "/api/people", Some(json!({"name": "Ann", "shoe": 1}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["validation_errors"]["shoe"].is_string());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/people")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{oops"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.rows("person").await.is_empty());
}

#[tokio::test]
async fn integrity_violation_rolls_back() {
    let app = app();
    let (status, _, body) = app
        .send(Method::POST, "/api/people", Some(json!({"age": 3, "pets": [{"name": "Rex"}]})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], json!("IntegrityError"));
    assert!(app.rows("pet").await.is_empty());
}

#[tokio::test]
async fn scalar_fields_survive_a_round_trip() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann", "age": 31, "birthday": "1993-02-03"})]).await;
    let (_, _, original) = app.send(Method::GET, "/api/people/1", None).await;

    let mut copy = original.as_object().unwrap().clone();
    for key in ["id", "pets", "tags", "employer"] {
        copy.remove(key);
    }
    let (status, _, created) = app.send(Method::POST, "/api/people", Some(Value::Object(copy.clone()))).await;
    assert_eq!(status, StatusCode::CREATED);
    for (key, value) in &copy {
        assert_eq!(&created[key], value, "field {}", key);
    }
}

#[tokio::test]
async fn add_links_existing_rows_without_duplicates() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"})]).await;
    app.seed("tag", vec![json!({"label": "red"})]).await;

    let payload = json!({"tags": {"add": [{"label": "red"}, {"label": "blue"}]}});
    let (status, _, body) = app.send(Method::PUT, "/api/people/1", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tags"].as_array().unwrap().len(), 2);
    app.send(Method::PUT, "/api/people/1", Some(payload)).await;

    assert_eq!(app.rows("tag").await.len(), 2);
    let (_, _, body) = app.send(Method::GET, "/api/people/1", None).await;
    assert_eq!(body["tags"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn put_single_updates_fields_and_relations() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"}), json!({"name": "Bob"})]).await;
    app.seed("pet", vec![json!({"name": "Old", "owner_id": 1})]).await;

    let (status, _, body) = app
        .send(
            Method::PUT,
            "/api/people/1",
            Some(json!({"name": "Anna", "birthday": "2001-01-02", "pets": [{"name": "New"}], "employer": {"name": "Acme"}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("Anna"));
    assert_eq!(body["birthday"], json!("2001-01-02"));
    assert_eq!(body["pets"], json!([{"id": 2, "name": "New", "owner_id": 1}]));
    assert_eq!(body["employer"]["name"], json!("Acme"));

    let (_, _, bob) = app.send(Method::GET, "/api/people/2", None).await;
    assert_eq!(bob["name"], json!("Bob"));
}

#[tokio::test]
async fn put_single_errors() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"})]).await;

    let (status, _, _) = app.send(Method::PUT, "/api/people/7", Some(json!({"name": "x"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = app.send(Method::PUT, "/api/people/1", Some(json!({"shoe": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("shoe"));

    let (status, _, _) = app.send(Method::PUT, "/api/people/1", Some(json!({"birthday": "someday"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(app.rows("person").await[0]["birthday"], Value::Null);
}

#[tokio::test]
async fn put_many_counts_modified_rows() {
    let app = app();
    app.seed(
        "person",
        [10, 20, 30, 40, 50].iter().map(|a| json!({"name": format!("p{}", a), "age": a})).collect(),
    )
    .await;
    let body = json!({"q": {"filters": {"age": {"gt": 30}}}, "name": "senior"});
    let (status, _, result) = app.send(Method::PUT, "/api/people", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result, json!({"num_modified": 2}));
    let seniors = app.rows("person").await.into_iter().filter(|r| r["name"] == json!("senior")).count();
    assert_eq!(seniors, 2);
}

#[tokio::test]
async fn delete_missing_instance_changes_nothing() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"})]).await;
    let writes = app.db.writes();
    let (status, _, _) = app.send(Method::DELETE, "/api/people/9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.db.writes(), writes);
    assert_eq!(app.rows("person").await.len(), 1);
}

#[tokio::test]
async fn delete_single_instance() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"}), json!({"name": "Bob"})]).await;
    let (status, _, body) = app.send(Method::DELETE, "/api/people/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
    let left = app.rows("person").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["name"], json!("Bob"));
}

#[tokio::test]
async fn delete_many_reports_count() {
    let app = app();
    app.seed("person", [10, 20, 30].iter().map(|a| json!({"name": "p", "age": a})).collect())
        .await;
    let spec = json!({"filters": {"age": {"lt": 25}}, "order_by": [{"field": "age", "direction": "desc"}]});
    let (status, _, body) = app.send(Method::DELETE, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"num_deleted": 2}));

    let none = json!({"filters": {"age": {"gt": 1000}}});
    let (status, _, body) = app.send(Method::DELETE, &format!("/api/people?q={}", q(&none)), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({}));
    assert_eq!(app.rows("person").await.len(), 1);
}

#[tokio::test]
async fn delete_relation_members() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"})]).await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 1}), json!({"name": "Tom", "owner_id": 1})]).await;

    let (status, _, body) = app.send(Method::DELETE, "/api/people/1/pets", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], json!("Cannot DELETE entire \"pets\" relation"));

    let (status, _, _) = app.send(Method::DELETE, "/api/people/1/pets/1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = app.send(Method::DELETE, "/api/people/1/pets/2?delete=true", None).await;
    assert_eq!(status, StatusCode::OK);

    let pets = app.rows("pet").await;
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0]["name"], json!("Rex"));
    assert_eq!(pets[0]["owner_id"], Value::Null);

    let (status, _, _) = app.send(Method::DELETE, "/api/people/1/pets/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
