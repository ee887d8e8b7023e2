//! Cross-module tests for the Newsdesk client, driven through scripted backends.

pub mod fakes;

#[cfg(test)]
mod unit;
