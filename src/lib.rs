// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Host-side driver for a Victron-style battery monitor, talking VE.Direct telemetry and the HEX
//! register protocol over a serial link.
//!
//! [`facade::Driver`] is the entry point: [`facade::Driver::start`] opens the serial port, spawns
//! the single-threaded protocol engine, and hands back a cheaply-cloneable handle onto it. Only
//! one engine ever runs per process, no matter how many times `start` is called (§5).

pub mod cache;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod message;
pub mod queue;
pub mod registers;
pub mod transport;

pub use facade::Driver;
