//! Register bus contract. The drivers and FSMs only ever see this trait;
//! whether registers travel over Modbus TCP or an in-memory simulator
//! (`crate::sim::SimBus`) is a wiring decision made in `main`.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Write a block of holding registers starting at `addr` on `device_id`.
    async fn write_registers(&self, device_id: u8, addr: u16, payload: &[u16]) -> Result<()>;

    /// Read `count` holding registers starting at `addr` on `device_id`.
    async fn read_registers(&self, device_id: u8, addr: u16, count: u16) -> Result<Vec<u16>>;
}

// ---------------------------------------------------------------------------
// Modbus TCP bus (production; requires the `modbus` feature and a reachable
// register server)
// ---------------------------------------------------------------------------

#[cfg(feature = "modbus")]
pub use modbus_tcp::ModbusBus;

#[cfg(feature = "modbus")]
mod modbus_tcp {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio_modbus::client::{tcp, Context, Reader, Writer};
    use tokio_modbus::slave::{Slave, SlaveContext};

    use crate::error::{ControlError, Result};

    /// One TCP connection shared by every device; devices are addressed by
    /// Modbus unit id. The connection is a serial resource, so calls are
    /// funneled through a mutex.
    pub struct ModbusBus {
        ctx: Mutex<Context>,
    }

    impl ModbusBus {
        pub async fn connect(addr: SocketAddr) -> Result<Self> {
            let ctx = tcp::connect(addr)
                .await
                .map_err(|e| ControlError::Transport(format!("modbus connect {addr}: {e}")))?;
            Ok(Self { ctx: Mutex::new(ctx) })
        }
    }

    #[async_trait]
    impl super::RegisterBus for ModbusBus {
        async fn write_registers(&self, device_id: u8, addr: u16, payload: &[u16]) -> Result<()> {
            let mut ctx = self.ctx.lock().await;
            ctx.set_slave(Slave(device_id));
            ctx.write_multiple_registers(addr, payload)
                .await
                .map_err(|e| ControlError::Transport(format!("write dev={device_id}: {e}")))?
                .map_err(|e| ControlError::Transport(format!("write dev={device_id}: {e}")))
        }

        async fn read_registers(&self, device_id: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
            let mut ctx = self.ctx.lock().await;
            ctx.set_slave(Slave(device_id));
            ctx.read_holding_registers(addr, count)
                .await
                .map_err(|e| ControlError::Transport(format!("read dev={device_id}: {e}")))?
                .map_err(|e| ControlError::Transport(format!("read dev={device_id}: {e}")))
        }
    }
}
