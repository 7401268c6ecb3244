pub mod ring;

pub use ring::{BoundedRing, IntegerEnergy, IntegerPower};
