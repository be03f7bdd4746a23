use document_transaction::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sample User document for testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl User {
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
        }
    }
}

impl Document for User {
    const COLLECTION: &'static str = "tx_users";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Sample Order document for testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_name: String,
    pub amount: i64,
    pub status: String,
}

impl Order {
    pub fn new(user_id: Uuid, product_name: &str, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            product_name: product_name.to_string(),
            amount,
            status: "open".to_string(),
        }
    }
}

impl Document for Order {
    const COLLECTION: &'static str = "tx_orders";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Document whose collection is never created, so every statement on it fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Missing {
    pub id: Uuid,
}

impl Document for Missing {
    const COLLECTION: &'static str = "tx_missing_collection";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Document stored in a collection named after an SQL reserved word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reserved {
    pub id: Uuid,
    pub label: String,
}

impl Document for Reserved {
    const COLLECTION: &'static str = "order";

    fn id(&self) -> Uuid {
        self.id
    }
}
