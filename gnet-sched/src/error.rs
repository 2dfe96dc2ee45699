// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use thiserror::Error;

use crate::task::TaskId;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is not a daemon")]
    NotDaemon(TaskId),
}
