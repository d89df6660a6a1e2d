/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `serve`   -- run the relay HTTP server
- `history` -- inspect stored conversations offline

These handlers are small and only wire library components together:
configuration, credentials, the conversation store, and the server.
*/

pub mod history;
pub mod serve;
