// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod shutdown;
pub mod tunnel_stream;
pub mod validators;
