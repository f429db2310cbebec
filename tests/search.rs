mod common;

use axum::http::{header, Method, StatusCode};
use common::{app, app_with, names, q, registry};
use restgen::{parse_model, resolve, ApiSettings, ResourceDecl};
use serde_json::{json, Value};

#[tokio::test]
async fn pages_are_sized_and_linked() {
    let app = app();
    app.seed("person", (1..=25).map(|i| json!({"name": format!("p{:02}", i)})).collect())
        .await;

    let (status, headers, body) = app.send(Method::GET, "/api/people?page=3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["num_results"], json!(25));
    assert_eq!(body["total_pages"], json!(3));
    assert_eq!(body["page"], json!(3));
    assert_eq!(body["objects"].as_array().unwrap().len(), 5);
    assert_eq!(names(&body)[0], "p21");
    let link = headers.get(header::LINK).unwrap().to_str().unwrap();
    assert!(link.contains("rel=\"last\""));
    assert!(!link.contains("rel=\"next\""));

    let (_, headers, body) = app.send(Method::GET, "/api/people?results_per_page=7", None).await;
    assert_eq!(body["total_pages"], json!(4));
    assert_eq!(body["objects"].as_array().unwrap().len(), 7);
    assert!(headers
        .get(header::LINK)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("page=2&results_per_page=7>; rel=\"next\""));
}

#[tokio::test]
async fn order_by_applies_in_sequence() {
    let app = app();
    app.seed(
        "person",
        vec![
            json!({"name": "Bob", "age": 30}),
            json!({"name": "Ann", "age": 20}),
            json!({"name": "Bob", "age": 40}),
            json!({"name": "Ann", "age": 25}),
        ],
    )
    .await;
    let spec = json!({"order_by": [{"field": "name", "direction": "asc"}, {"field": "age", "direction": "desc"}]});
    let uri = format!("/api/people?q={}", q(&spec));

    let (status, _, first) = app.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let ages: Vec<i64> = first["objects"].as_array().unwrap().iter().map(|o| o["age"].as_i64().unwrap()).collect();
    assert_eq!(names(&first), ["Ann", "Ann", "Bob", "Bob"]);
    assert_eq!(ages, [25, 20, 40, 30]);

    let (_, _, second) = app.send(Method::GET, &uri, None).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn or_filter_matches_missing_values() {
    let app = app();
    app.seed(
        "person",
        vec![
            json!({"name": "kid", "age": 10}),
            json!({"name": "adult", "age": 20}),
            json!({"name": "unknown"}),
            json!({"name": "older", "age": 30}),
        ],
    )
    .await;
    let spec = json!({"filters": {"$or": [{"age": {"gt": 18}}, {"age": {"is_null": null}}]}});
    let (status, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body), ["adult", "unknown", "older"]);
}

#[tokio::test]
async fn relation_filters() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"}), json!({"name": "Bob"})]).await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 1})]).await;

    let spec = json!({"filters": {"pets": {"any": {"name": {"eq": "Rex"}}}}});
    let (_, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(names(&body), ["Ann"]);

    let spec = json!({"filters": {"pets": {"is_null": null}}});
    let (_, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(names(&body), ["Bob"]);
}

#[tokio::test]
async fn has_on_to_one_and_primary_key_arguments() {
    let app = app();
    app.seed("company", vec![json!({"name": "Acme"}), json!({"name": "Globex"})]).await;
    app.seed(
        "person",
        vec![
            json!({"name": "Ann", "employer_id": 1}),
            json!({"name": "Bob", "employer_id": 2}),
            json!({"name": "Cy"}),
        ],
    )
    .await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 2}), json!({"name": "Tom", "owner_id": 1})]).await;

    let spec = json!({"filters": {"employer": {"has": {"name": {"eq": "Acme"}}}}});
    let (status, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body), ["Ann"]);

    let spec = json!({"filters": {"employer": {"has": 2}}});
    let (_, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(names(&body), ["Bob"]);

    let spec = json!({"filters": {"pets": {"any": 1}}});
    let (_, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(names(&body), ["Bob"]);

    let spec = json!({"filters": {"employer": {"is_null": null}}});
    let (_, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(names(&body), ["Cy"]);
}

#[tokio::test]
async fn group_by_keeps_one_row_per_group() {
    let app = app();
    app.seed(
        "person",
        vec![
            json!({"name": "Ann", "age": 30}),
            json!({"name": "Bob", "age": 20}),
            json!({"name": "Cy", "age": 30}),
            json!({"name": "Dee"}),
            json!({"name": "Eve"}),
        ],
    )
    .await;
    let spec = json!({"group_by": [{"field": "age"}], "order_by": [{"field": "name", "direction": "desc"}]});
    let (status, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&spec)), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body), ["Dee", "Bob", "Ann"]);
    assert_eq!(body["num_results"], json!(3));

    let unknown = json!({"group_by": [{"field": "shoe"}]});
    let (status, _, _) = app.send(Method::GET, &format!("/api/people?q={}", q(&unknown)), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn page_beyond_every_offset_is_empty() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"}), json!({"name": "Bob"})]).await;
    let spec = json!({"offset": 1});
    let uri = format!("/api/people?page={}&q={}", u64::MAX, q(&spec));
    let (status, _, body) = app.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["page"], json!(u64::MAX));
    assert_eq!(body["objects"], json!([]));
}

const TEAMS: &str = r#"{"entities": [
    {"name": "team", "primary_key": "code", "fields": [
        {"name": "code", "type": "text", "nullable": false}
     ], "relations": [
        {"name": "members", "target": "member", "cardinality": "to_many",
         "join": {"kind": "foreign", "column": "team_code"}}
     ]},
    {"name": "member", "fields": [
        {"name": "id", "type": "int8", "nullable": false, "has_default": true},
        {"name": "name", "type": "text"},
        {"name": "team_code", "type": "text"}
    ]}
]}"#;

#[tokio::test]
async fn text_keys_that_differ_in_case_keep_their_own_children() {
    let registry = resolve(&parse_model(TEAMS).unwrap()).unwrap();
    let app = app_with(ApiSettings::default(), registry, |m| {
        m.create_api(ResourceDecl::new("team", "teams")).unwrap();
    });
    app.seed("team", vec![json!({"code": "a"}), json!({"code": "A"})]).await;
    app.seed(
        "member",
        vec![json!({"name": "lower", "team_code": "a"}), json!({"name": "upper", "team_code": "A"})],
    )
    .await;

    let (status, _, body) = app.send(Method::GET, "/api/teams", None).await;
    assert_eq!(status, StatusCode::OK);
    let members: Vec<(String, Vec<Value>)> = body["objects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| {
            let names = t["members"].as_array().unwrap().iter().map(|m| m["name"].clone()).collect();
            (t["code"].as_str().unwrap().to_string(), names)
        })
        .collect();
    assert_eq!(
        members,
        vec![("A".to_string(), vec![json!("upper")]), ("a".to_string(), vec![json!("lower")])]
    );

    let (status, _, body) = app.send(Method::GET, "/api/teams/a/members", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body), ["lower"]);
}

#[tokio::test]
async fn bad_search_specs_are_rejected() {
    let app = app();
    let bad_field = json!({"order_by": [{"field": "shoe_size"}]});
    let (status, _, body) = app.send(Method::GET, &format!("/api/people?q={}", q(&bad_field)), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("shoe_size"));

    let bad_direction = json!({"order_by": [{"field": "name", "direction": "sideways"}]});
    let (status, _, _) = app.send(Method::GET, &format!("/api/people?q={}", q(&bad_direction)), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bad_operator = json!({"filters": {"name": {"resembles": "x"}}});
    let (status, _, _) = app.send(Method::GET, &format!("/api/people?q={}", q(&bad_operator)), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = app.send(Method::GET, "/api/people?q=%7Bnot%20json", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn legacy_mode_answers_520() {
    let settings = ApiSettings {
        legacy_error_status: true,
        ..ApiSettings::default()
    };
    let app = app_with(settings, registry(), |m| {
        m.create_api(ResourceDecl::new("person", "people")).unwrap();
    });
    let (status, _, body) = app.send(Method::GET, "/api/people/42", None).await;
    assert_eq!(status.as_u16(), 520);
    assert_eq!(body, json!({"message": "No result found"}));
}

#[tokio::test]
async fn single_instance_carries_one_level_of_relations() {
    let app = app();
    app.seed("company", vec![json!({"name": "Acme"})]).await;
    app.seed("person", vec![json!({"name": "Ann", "employer_id": 1}), json!({"name": "Bob"})]).await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 1}), json!({"name": "Tom", "owner_id": 1})]).await;
    app.seed("tag", vec![json!({"label": "red"})]).await;
    let person = app.entity("person").clone();
    let restgen::config::Join::Link(link) = &person.relation("tags").unwrap().join else {
        unreachable!()
    };
    app.db.seed_link(link, json!(1), json!(1)).await;

    let (status, _, body) = app.send(Method::GET, "/api/people/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("Ann"));
    assert_eq!(body["employer"], json!({"id": 1, "name": "Acme"}));
    assert_eq!(body["pets"].as_array().unwrap().len(), 2);
    assert_eq!(body["tags"], json!([{"id": 1, "label": "red"}]));

    let (_, _, bob) = app.send(Method::GET, "/api/people/2", None).await;
    assert_eq!(bob["employer"], json!(null));
    assert_eq!(bob["pets"], json!([]));

    let (status, _, _) = app.send(Method::GET, "/api/people/99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = app.send(Method::GET, "/api/people/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn relation_sub_resources() {
    let app = app();
    app.seed("person", vec![json!({"name": "Ann"})]).await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 1}), json!({"name": "Tom", "owner_id": 1})]).await;

    let (status, _, body) = app.send(Method::GET, "/api/people/1/pets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["num_results"], json!(2));
    assert_eq!(names(&body), ["Rex", "Tom"]);

    let (status, _, body) = app.send(Method::GET, "/api/people/1/pets/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("Tom"));

    let (status, _, _) = app.send(Method::GET, "/api/people/1/pets/9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = app.send(Method::GET, "/api/people/1/friends", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn projection_rules_and_methods() {
    let registry = registry()
        .with_method("person", "shout", |r| {
            json!(r.get("name").as_str().map(str::to_uppercase))
        })
        .unwrap();
    let app = app_with(ApiSettings::default(), registry, |m| {
        let mut decl = ResourceDecl::new("person", "people");
        decl.exclude_columns = Some(vec!["age".into(), "pets.name".into(), "tags".into()]);
        decl.include_methods = Some(vec!["shout".into()]);
        m.create_api(decl).unwrap();
    });
    app.seed("person", vec![json!({"name": "Ann", "age": 3})]).await;
    app.seed("pet", vec![json!({"name": "Rex", "owner_id": 1})]).await;

    let (_, _, body) = app.send(Method::GET, "/api/people/1", None).await;
    assert!(body.get("age").is_none());
    assert!(body.get("tags").is_none());
    assert_eq!(body["shout"], json!("ANN"));
    assert_eq!(body["pets"], json!([{"id": 1, "owner_id": 1}]));
}

#[tokio::test]
async fn only_declared_methods_are_mounted() {
    let app = app_with(ApiSettings::default(), registry(), |m| {
        m.create_api(ResourceDecl::new("person", "people")).unwrap();
    });
    let (status, _, _) = app.send(Method::POST, "/api/people", Some(json!({"name": "x"}))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let (status, _, _) = app.send(Method::DELETE, "/api/people/1", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let (status, _, _) = app.send(Method::GET, "/api/people", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn common_routes_respond() {
    let app = app();
    let (status, _, body) = app.send(Method::GET, "/health", None).await;
    assert_eq!((status, body), (StatusCode::OK, json!({"status": "ok"})));
    let (status, _, body) = app.send(Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], json!("ok"));
    let (_, _, body) = app.send(Method::GET, "/version", None).await;
    assert_eq!(body["name"], json!("restgen"));
}
