use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;

/// A typed integration event.
///
/// `NAME` is the discriminator stored in the outbox `name` column and used as
/// the broker routing key.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated { order_id: String }
///
/// impl IntegrationEvent for OrderCreated {
///     const NAME: &'static str = "OrderCreated";
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned {
    const NAME: &'static str;

    /// Codec used when the event is written to the outbox.
    fn codec() -> Codec {
        Codec::Json
    }
}
