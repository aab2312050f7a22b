// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Debug, Display};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const PROTOCOL_SEPARATOR: &str = "://";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    File,
    Ram,
    S3,
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match &self {
            Protocol::File => "file",
            Protocol::Ram => "ram",
            Protocol::S3 => "s3",
        }
    }

    pub fn is_file_storage(&self) -> bool {
        matches!(&self, Protocol::File | Protocol::Ram)
    }

    pub fn is_object_storage(&self) -> bool {
        matches!(&self, Protocol::S3)
    }
}

impl Display for Protocol {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(protocol: &str) -> anyhow::Result<Self> {
        match protocol {
            "file" => Ok(Protocol::File),
            "ram" => Ok(Protocol::Ram),
            "s3" => Ok(Protocol::S3),
            _ => bail!("unknown URI protocol `{protocol}`"),
        }
    }
}

/// Encapsulates the URI type (file path, S3 location, ...) and a path to the
/// resource it identifies. A URI with no protocol is interpreted as a file
/// path.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Uri {
    uri: String,
    protocol: Protocol,
}

impl Uri {
    /// Constructs a [`Uri`] from a string known to be well-formed.
    /// Panics otherwise.
    pub fn from_well_formed<S: ToString>(uri: S) -> Self {
        let uri = uri.to_string();
        Uri::from_str(&uri).expect("URI should be well-formed")
    }

    #[cfg(any(test, feature = "testsuite"))]
    pub fn for_test(uri: &str) -> Self {
        Uri::from_str(uri).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the file path of the URI, provided it identifies a local
    /// resource.
    pub fn filepath(&self) -> Option<&Path> {
        if self.protocol == Protocol::File {
            let path = self
                .uri
                .strip_prefix("file://")
                .unwrap_or(self.uri.as_str());
            Some(Path::new(path))
        } else {
            None
        }
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.uri
    }
}

impl Debug for Uri {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.debug_struct("Uri").field("uri", &self.uri).finish()
    }
}

impl Display for Uri {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str(&self.uri)
    }
}

impl FromStr for Uri {
    type Err = anyhow::Error;

    fn from_str(uri_str: &str) -> anyhow::Result<Self> {
        if uri_str.is_empty() {
            bail!("failed to parse empty URI");
        }
        let (protocol, _) = match uri_str.split_once(PROTOCOL_SEPARATOR) {
            Some((protocol_str, path)) => {
                let protocol = Protocol::from_str(protocol_str)
                    .with_context(|| format!("failed to parse URI `{uri_str}`"))?;
                (protocol, path)
            }
            None => (Protocol::File, uri_str),
        };
        Ok(Uri {
            uri: uri_str.to_string(),
            protocol,
        })
    }
}

impl PartialEq<&str> for Uri {
    fn eq(&self, other: &&str) -> bool {
        &self.uri == other
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.uri)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uri_str = String::deserialize(deserializer)?;
        Uri::from_str(&uri_str).map_err(D::Error::custom)
    }
}
