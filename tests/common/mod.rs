pub mod entities;

pub use entities::{Missing, Order, Reserved, User};

use document_transaction::{DocumentStore, Model, StoreConfig};

pub struct Fixture {
    pub store: DocumentStore,
    pub users: Model<User>,
    pub orders: Model<Order>,
}

/// Connect using `DATABASE_URL` (or the local default) and create fresh collections
pub async fn setup() -> Fixture {
    let config = StoreConfig::from_env().expect("Invalid store configuration");
    let store = DocumentStore::connect(&config)
        .await
        .expect("Failed to connect to database");

    let users = store.model::<User>().expect("Invalid users collection");
    let orders = store.model::<Order>().expect("Invalid orders collection");

    for result in [users.drop_collection().await, orders.drop_collection().await] {
        result.expect("Failed to drop collection");
    }
    users.ensure_collection().await.expect("Failed to create users collection");
    orders.ensure_collection().await.expect("Failed to create orders collection");

    Fixture { store, users, orders }
}

/// Clean up database after tests
pub async fn cleanup(fixture: Fixture) {
    fixture.orders.drop_collection().await.expect("Failed to drop orders collection");
    fixture.users.drop_collection().await.expect("Failed to drop users collection");
    fixture.store.pool().close().await;
}
