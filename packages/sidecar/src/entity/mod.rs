pub mod outbox_event;
