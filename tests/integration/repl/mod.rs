mod disconnect;
mod e2e;
mod interleave;
mod live_sync;
