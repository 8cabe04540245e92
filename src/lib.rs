//! # diversify-rs
//!
//! $$
//! \text{returns} \xrightarrow{\text{Stage 1}} \mathcal{P}^\* \xrightarrow{\text{Stage 2}} \mathbf{w}^\*
//! $$
//!
//! Diversification-first portfolio construction with gradual rebalancing,
//! realism checks and traceable explanations.

pub mod error;
pub mod portfolio;

pub use error::PortfolioError;
pub use error::Result;
