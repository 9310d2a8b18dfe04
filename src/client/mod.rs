//! Client façade: the link actor, its event surface and the cloneable handle.

pub mod actor;
pub mod events;
pub mod handle;

pub use actor::{LinkActor, LinkActorArgs};
pub use events::{
    ChannelObserver, EventBus, LinkEvent, LinkObserver, LinkObserverHandle, SubscriptionId,
};
pub use handle::LinkClient;
