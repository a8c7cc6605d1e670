/*!
    agent bridging a motor control board to a message bus

    the board exposes a register file over a point to point uart link. The agent polls its status registers,
    publishes state changes on the bus, and translates commands received from the bus into register writes.

    - [frame] assembles and checks the frames of the register protocol
    - [link] owns the serial port and serializes register exchanges
    - [poller], [router] and [bus] are the tasks sharing the link
    - [agent] starts and stops everything
*/

pub mod frame;
pub mod registers;
pub mod link;
pub mod store;
pub mod router;
pub mod poller;
pub mod bus;
pub mod settings;
pub mod agent;
