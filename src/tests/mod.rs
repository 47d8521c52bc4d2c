// Collaborator fakes and cross-module scenarios

pub mod mocks;

mod shell_tests;
