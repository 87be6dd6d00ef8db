pub mod axis;
pub mod case;
pub mod classify;
pub mod common;
pub mod compile;
pub mod dag;
pub mod dispatch;
pub mod encode;
pub mod generate;
pub mod info;
pub mod pprint;
pub mod schedule;
pub mod storage;
pub mod target;
