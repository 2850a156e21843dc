//! An order service (producer) and a shipping service (consumer).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sourced_outbox::{
    Envelope, HandlerError, HandlerRegistry, IntegrationEvent, MemoryStore, MemoryTransaction,
    StoreError, TransactionCoordinator, TransactionError,
};
use thiserror::Error;

pub const ORDERS: &str = "orders";
pub const SHIPMENTS: &str = "shipments";
pub const COUNTERS: &str = "counters";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub total_cents: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub order_id: String,
    pub customer: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: String,
    pub customer: String,
    pub total_cents: u64,
}

impl IntegrationEvent for OrderCreated {
    const NAME: &'static str = "OrderCreated";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: String,
}

impl IntegrationEvent for OrderConfirmed {
    const NAME: &'static str = "OrderConfirmed";
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order {0} already exists")]
    Duplicate(String),
    #[error("order total must be positive")]
    EmptyOrder,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Insert an order and publish `OrderCreated` in the same unit of work.
pub fn place_order(
    coordinator: &TransactionCoordinator<MemoryStore>,
    id: &str,
    customer: &str,
    total_cents: u64,
) -> Result<(), TransactionError<OrderError>> {
    coordinator.execute(|tx, events| {
        if total_cents == 0 {
            return Err(OrderError::EmptyOrder);
        }
        if tx.get::<Order>(ORDERS, id)?.is_some() {
            return Err(OrderError::Duplicate(id.to_string()));
        }
        tx.put(
            ORDERS,
            id,
            &Order {
                id: id.to_string(),
                customer: customer.to_string(),
                total_cents,
            },
        )?;
        events.set_header("correlation_id", format!("place-{}", id));
        events.publish(&OrderCreated {
            order_id: id.to_string(),
            customer: customer.to_string(),
            total_cents,
        });
        Ok(())
    })
}

/// Place an order and confirm it right away: two events from one commit.
pub fn place_and_confirm(
    coordinator: &TransactionCoordinator<MemoryStore>,
    id: &str,
) -> Result<(), TransactionError<OrderError>> {
    coordinator.execute(|tx, events| {
        tx.put(
            ORDERS,
            id,
            &Order {
                id: id.to_string(),
                customer: "walk-in".to_string(),
                total_cents: 100,
            },
        )?;
        events.publish(&OrderCreated {
            order_id: id.to_string(),
            customer: "walk-in".to_string(),
            total_cents: 100,
        });
        events.publish(&OrderConfirmed {
            order_id: id.to_string(),
        });
        Ok::<_, OrderError>(())
    })
}

fn bump(tx: &mut MemoryTransaction, counter: &str) -> Result<u64, StoreError> {
    let next = tx.get::<u64>(COUNTERS, counter)?.unwrap_or(0) + 1;
    tx.put(COUNTERS, counter, &next)?;
    Ok(next)
}

/// Shipping side: every `OrderCreated` creates a shipment and bumps the
/// `shipments` counter. `calls` counts handler invocations, committed or not.
pub fn shipping_handlers(calls: Arc<AtomicUsize>) -> HandlerRegistry<MemoryTransaction> {
    let mut registry = HandlerRegistry::new();
    registry
        .register_event(
            move |tx: &mut MemoryTransaction, event: OrderCreated, _: &Envelope| -> Result<(), HandlerError> {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.put(
                    SHIPMENTS,
                    &event.order_id,
                    &Shipment {
                        order_id: event.order_id.clone(),
                        customer: event.customer,
                    },
                )?;
                bump(tx, "shipments")?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register_event(
            |tx: &mut MemoryTransaction, _: OrderConfirmed, _: &Envelope| -> Result<(), HandlerError> {
                bump(tx, "confirmations")?;
                Ok(())
            },
        )
        .unwrap();
    registry
}

/// A shipping side whose warehouse is down: every `OrderCreated` fails after
/// writing, so only the rollback keeps the shipment table empty.
pub fn failing_shipping_handlers(calls: Arc<AtomicUsize>) -> HandlerRegistry<MemoryTransaction> {
    let mut registry = HandlerRegistry::new();
    registry
        .register_event(
            move |tx: &mut MemoryTransaction, event: OrderCreated, _: &Envelope| -> Result<(), HandlerError> {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.put(
                    SHIPMENTS,
                    &event.order_id,
                    &Shipment {
                        order_id: event.order_id.clone(),
                        customer: event.customer,
                    },
                )?;
                Err("warehouse offline".into())
            },
        )
        .unwrap();
    registry
}

pub fn counter(store: &MemoryStore, name: &str) -> u64 {
    store.row::<u64>(COUNTERS, name).unwrap().unwrap_or(0)
}
