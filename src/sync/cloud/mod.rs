//! Reconcilers for the account backend. Every family is downloaded page by
//! page since its cursor; uploads only happen while a family is merged for
//! the first time.

pub mod episodes;
pub mod lists;
pub mod movies;
pub mod shows;

pub use episodes::CloudEpisodeSync;
pub use lists::ListReconciler;
pub use movies::MovieReconciler;
pub use shows::ShowReconciler;
