//! Unit test suite

mod test_cli;
mod test_fsm;
mod test_scenarios;
