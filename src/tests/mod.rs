// Test modules for igdctl
// Backend tests run against loopback mock routers from `support`

mod support;
