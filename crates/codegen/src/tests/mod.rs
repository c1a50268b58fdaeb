pub mod helpers;

mod integration_tests;
