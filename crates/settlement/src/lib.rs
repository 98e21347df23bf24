//! Vote Cart and Batch Settlement
//!
//! - [`cart`]: pending stake instructions, merged per vault
//! - [`orchestrator`]: settles a cart as a withdraw phase followed by a
//!   deposit phase, each one atomic multi-item call
//! - [`withdraw`]: single-position and proportional withdrawals outside a
//!   cart
//!
//! ## Usage
//!
//! ```rust,ignore
//! let orchestrator = SettlementOrchestrator::new(config, chain, session, resolver);
//! let mut progress = orchestrator.subscribe_progress();
//!
//! match orchestrator.execute(&mut cart).await {
//!     Ok(result) => println!("deposited {}", result.deposited_items),
//!     Err(failure) if failure.partial.is_partial() => {
//!         // Withdrawals are committed; `cart` now holds only the deposits
//!     }
//!     Err(failure) => eprintln!("{}: {}", failure.code(), failure),
//! }
//! ```

pub mod cart;
pub mod orchestrator;
pub mod withdraw;


pub use cart::VoteCart;
pub use orchestrator::{
    ExecutionFailure, ExecutionOptions, ExecutionResult, SettlementOrchestrator, SettlementProgress,
    SettlementStatus,
};
pub use withdraw::WithdrawOutcome;
