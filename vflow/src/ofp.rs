/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! OpenFlow protocol versions, as far as the flow pipeline cares about them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// An OpenFlow protocol version.  The discriminants are the `version` field of the OpenFlow
/// header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Version {
    OFP10 = 0x01,
    OFP11 = 0x02,
    OFP12 = 0x03,
    OFP13 = 0x04,
    OFP14 = 0x05,
    OFP15 = 0x06,
}

bitflags! {
    pub struct Versions: u32 {
        const OFP10 = 1 << Version::OFP10 as u32;
        const OFP11 = 1 << Version::OFP11 as u32;
        const OFP12 = 1 << Version::OFP12 as u32;
        const OFP13 = 1 << Version::OFP13 as u32;
        const OFP14 = 1 << Version::OFP14 as u32;
        const OFP15 = 1 << Version::OFP15 as u32;

        /* OpenFlow 1.0 switches send unmatched packets to the controller on their own.  Every
         * later version drops them unless a table-miss entry says otherwise. */
        const LEGACY = Self::OFP10.bits;
        const TABLE_MISS = (Self::OFP11.bits |
                            Self::OFP12.bits |
                            Self::OFP13.bits |
                            Self::OFP14.bits |
                            Self::OFP15.bits);
    }
}

impl From<Version> for Versions {
    fn from(v: Version) -> Versions {
        Versions::from_bits_truncate(1 << v as u32)
    }
}

impl Version {
    pub const ALL: [Version; 6] = [
        Version::OFP10,
        Version::OFP11,
        Version::OFP12,
        Version::OFP13,
        Version::OFP14,
        Version::OFP15,
    ];

    /// Returns the version with OpenFlow header value `wire`, if any.
    pub fn from_wire(wire: u8) -> Option<Version> {
        Self::ALL.into_iter().find(|v| *v as u8 == wire)
    }

    /// True if a switch speaking this version needs a table-miss entry to forward unmatched
    /// packets to the controller.
    pub fn needs_table_miss(self) -> bool {
        Versions::TABLE_MISS.contains(self.into())
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Version::OFP10 => "1.0",
            Version::OFP11 => "1.1",
            Version::OFP12 => "1.2",
            Version::OFP13 => "1.3",
            Version::OFP14 => "1.4",
            Version::OFP15 => "1.5",
        };
        write!(f, "OpenFlow {}", s)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Accepts "1.3", "OpenFlow13", "OF13" and "OFP13" style spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
        match digits.as_str() {
            "10" => Ok(Version::OFP10),
            "11" => Ok(Version::OFP11),
            "12" => Ok(Version::OFP12),
            "13" => Ok(Version::OFP13),
            "14" => Ok(Version::OFP14),
            "15" => Ok(Version::OFP15),
            _ => Err(format!("{s}: unknown OpenFlow version")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_miss_versions() {
        assert!(!Version::OFP10.needs_table_miss());
        for v in &Version::ALL[1..] {
            assert!(v.needs_table_miss(), "{v}");
        }
        assert_eq!(Versions::LEGACY | Versions::TABLE_MISS, Versions::all());
    }

    #[test]
    fn parse_versions() {
        assert_eq!("1.3".parse::<Version>(), Ok(Version::OFP13));
        assert_eq!("OpenFlow10".parse::<Version>(), Ok(Version::OFP10));
        assert_eq!("OFP15".parse::<Version>(), Ok(Version::OFP15));
        assert!("2.0".parse::<Version>().is_err());
        assert_eq!(Version::from_wire(0x04), Some(Version::OFP13));
        assert_eq!(Version::from_wire(0x07), None);
    }
}
