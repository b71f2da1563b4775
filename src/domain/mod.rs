pub mod decision;
pub mod instrument;
pub mod opinion;
pub mod order;

pub use decision::{Decision, DecisionStatus};
pub use instrument::{AssetClass, Instrument, InstrumentCatalog};
pub use opinion::{Direction, Opinion};
pub use order::{
    AccountSnapshot, BracketKind, Order, OrderSide, OrderStatus, OrderType, Position,
    PositionSide, TimeInForce,
};
