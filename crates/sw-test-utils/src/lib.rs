// sw-test-utils: shared test utilities for the StationWatch workspace.
//
// Provides a mock rig control service (push channel plus request/response
// routes) for integration tests of the monitor.

pub mod mock_station_server;

pub use mock_station_server::{MockStationServer, RecordedCommand, default_settings, default_status};
