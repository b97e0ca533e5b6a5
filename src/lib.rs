/*!
An embedded, transactional, ordered key/value store with MVCC snapshot
isolation.

A database is a set of partitioned, mmap-backed page files (`pagefile`)
addressed through a copy-on-write B+-tree (`btree`) and an in-memory
override index (`ovr`) that gives every transaction a stable snapshot
without locking readers against writers. `db` is the entry point most
callers want: `Db::open`, `Db::begin`, and the convenience
non-transactional `get`/`put`/`del`.
*/
#![cfg_attr(feature = "lints", deny(warnings))]
#![allow(dead_code)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate quick_error;

mod buffer;
mod constants;
mod encode;
mod error;
mod page;
mod pagefile;
mod ovr;
mod tpio;
mod btree;
mod overview_table;
mod rebase;
mod db;

pub use buffer::Buf;
pub use btree::{PutMode, Query, QueryType};
pub use db::{Cursor, Db, OpenOptions, Transaction, DEFAULT_TABLE};
pub use error::{Error, Result};
