pub mod bridge;
pub mod connectivity;
pub mod outbox;
pub mod receipts;
