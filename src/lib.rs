// High-level overview:
//
// Protocol:                      serial bus                                      rouille
// Library Concept:   fixtures <--------------> hardware <---- visual_manager <-----------> control api <------> user
//                                                 ^               ^
//                    screen units <---- tcp ------+               | SwitchTarget
//                                                                 |
//                                                             auto_mode <---- beat input
//
// Implementing Binary:                                          boxi-daemon
//                    screen-unit-dummy

pub mod args;
pub mod auto_mode;
pub mod bus;
pub mod bus_msg;
pub mod catalog;
pub mod config;
pub mod display_link;
pub mod display_msg;
pub mod display_server;
pub mod frames;
pub mod hardware;
pub mod selection;
pub mod storage;
pub mod visual_manager;

pub use visual_manager::*;
