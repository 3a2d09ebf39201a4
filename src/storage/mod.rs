pub mod queue_db;
