mod cancel_tests;
mod stream_tests;
mod state_tests;
mod transport_tests;
