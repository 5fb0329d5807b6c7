// tern: a virtual machine for a small statically-typed functional
// language.
//
// Copyright (C) 2025  Tern contributors
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate enumflags2;
extern crate nix;
extern crate num_enum;
extern crate regex;
extern crate ron;
extern crate serde;
extern crate thiserror;
extern crate tracing;
#[macro_use]
extern crate lazy_static;


pub mod asm;
pub mod builder;
pub mod bytecode;
pub mod config;
pub mod datatype;
pub mod error;
pub mod funcword;
pub mod gc;
pub mod stack;
pub mod stackinfo;
pub mod value;
pub mod vm;
