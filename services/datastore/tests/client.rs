//! HTTP client against a live server.

use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

use historical_datastore::api::{create_router, AppState};
use historical_datastore::client::HttpClient;
use historical_datastore::data::{DataController, Query, SqliteStorage};
use historical_datastore::registry::memory::MemoryBackend;
use historical_datastore::registry::{DataStream, RegistryController, RegistryStorage, ValueType};
use historical_datastore::senml::{DenormMask, Record};
use historical_datastore::Error;

async fn serve() -> HttpClient {
    let storage = Arc::new(SqliteStorage::connect(":memory:").await.unwrap());
    let registry_storage = Arc::new(RegistryStorage::new(Arc::new(MemoryBackend::new())));
    registry_storage.add_listener(storage.clone());
    let registry = Arc::new(RegistryController::new(registry_storage));
    let data = Arc::new(DataController::new(registry.clone(), storage, false));
    let app = create_router(AppState::new(registry, data, "1.0.0"), None);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    HttpClient::new(&format!("http://{addr}/")).unwrap()
}

fn record(name: &str, t: f64, v: f64) -> Record {
    Record {
        name: name.into(),
        time: t,
        value: Some(v),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_registry_through_client() {
    let client = serve().await;

    let mut stream = DataStream::new("site:a/temp", ValueType::Float).with_unit("Cel");
    stream.meta.insert("room".into(), json!("main hall"));
    let location = client.add(&stream).await.unwrap();
    assert_eq!(location, "/registry/site%3Aa%2Ftemp");

    let err = client.add(&stream).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err:?}");

    let fetched = client.get("site:a/temp").await.unwrap();
    assert_eq!(fetched.unit, "Cel");

    let found = client
        .filter_one("meta.room", "equals", "main hall")
        .await
        .unwrap();
    assert_eq!(found.map(|s| s.name), Some("site:a/temp".to_string()));
    assert!(client
        .filter_one("meta.room", "equals", "cellar")
        .await
        .unwrap()
        .is_none());

    client
        .update(
            "site:a/temp",
            &DataStream::new("site:a/temp", ValueType::Float).with_unit("K"),
        )
        .await
        .unwrap();
    let list = client.filter("unit", "equals", "K", 1, 10).await.unwrap();
    assert_eq!(list.total, 1);

    client.delete("site:a/temp").await.unwrap();
    let list = client.get_many(1, 10).await.unwrap();
    assert_eq!(list.total, 0);
    let err = client.get("site:a/temp").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn test_data_through_client() {
    let client = serve().await;
    client
        .add(&DataStream::new("room/temp", ValueType::Float))
        .await
        .unwrap();

    let pack: Vec<Record> = (0..3)
        .map(|i| record("room/temp", 1_700_000_000.0 + f64::from(i), f64::from(i)))
        .collect();
    let ids = vec!["room/temp".to_string()];
    client.submit(&pack, &ids).await.unwrap();

    let err = client
        .submit(&[record("other", 1_700_000_000.0, 1.0)], &ids)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)), "{err:?}");

    let q = Query {
        sort_asc: true,
        per_page: 2,
        denormalize: DenormMask::ALL,
        count: true,
        ..Default::default()
    };
    let first = client.query(&ids, &q).await.unwrap();
    assert_eq!(first.total, Some(3));
    assert_eq!(first.data.len(), 2);
    assert_eq!(first.data[0].value, Some(0.0));

    let second = client.next_page(&first).await.unwrap().unwrap();
    assert_eq!(second.page, 2);
    assert_eq!(second.data.len(), 1);
    assert_eq!(second.data[0].value, Some(2.0));
    assert!(client.next_page(&second).await.unwrap().is_none());

    client
        .delete_records(&ids, 0.0, 1_700_000_002.0)
        .await
        .unwrap();
    let rest = client.query(&ids, &q).await.unwrap();
    assert_eq!(rest.total, Some(1));
}
