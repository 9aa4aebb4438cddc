// Copyright 2025 jonefeewang@gmail.com
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingType {
    Error,
    Detailed,
}

/// Client-side logging switches pushed to connected clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientLoggingInfo {
    pub errors: bool,
    pub detailed: bool,
}

impl ClientLoggingInfo {
    pub fn is_enabled(&self, kind: LoggingType) -> bool {
        match kind {
            LoggingType::Error => self.errors,
            LoggingType::Detailed => self.detailed,
        }
    }

    /// Returns true if the switch actually changed.
    pub fn set(&mut self, kind: LoggingType, enabled: bool) -> bool {
        let switch = match kind {
            LoggingType::Error => &mut self.errors,
            LoggingType::Detailed => &mut self.detailed,
        };
        let changed = *switch != enabled;
        *switch = enabled;
        changed
    }
}
