pub mod ledger;
pub mod rig;
