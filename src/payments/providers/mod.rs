pub mod qr_gateway;
