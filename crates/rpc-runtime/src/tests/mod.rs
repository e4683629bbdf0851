//! Scenario tests spanning several modules

mod socket_tests;
