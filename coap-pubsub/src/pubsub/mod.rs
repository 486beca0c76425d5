// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The publish/subscribe topic model.
//!
//! A topic is three things: an entry in the topic collection, a
//! configuration resource holding its metadata, and a data resource that
//! carries the published representation and the subscriber set.

use super::*;

mod topic;
pub use topic::TopicCfg;

mod manager;
pub use manager::Notification;
pub use manager::PinnedRep;
pub use manager::PubSubManager;
pub use manager::Subscription;
pub use manager::Topic;
pub use manager::TopicData;
