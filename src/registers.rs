/*!
    register map of the motor board

    each register is described by a value type and a constant of type [Register] giving its address in the board's memory.
    The map is compiled in and mirrors the board firmware, all multi-byte values are little endian.
*/

use core::marker::PhantomData;


/// integer used for addressing board memory
pub type Address = u8;

/**
    a register is a typed pointer in board memory

    it only holds the address of the starting byte of the referenced value, hence can be created, copied or destroyed at no cost.
    Its width is the size of its value type and never changes.
*/
#[derive(PartialEq, Eq, Hash, Debug)]
pub struct Register<T> {
    addr: Address,
    ty: PhantomData<T>,
}
impl<T> Register<T> {
    /// create a register from its starting byte
    pub const fn new(address: Address) -> Self {
        Self {addr: address, ty: PhantomData}
    }
    /// starting byte in memory
    pub const fn address(&self) -> Address {self.addr}
}
impl<T: RegisterValue> Register<T> {
    /// number of bytes of this register
    pub const fn size(&self) -> usize {T::SIZE}
}
impl<T> Clone for Register<T> {
    fn clone(&self) -> Self {
        Self::new(self.address())
    }
}
impl<T> Copy for Register<T> {}


/// value that can be stored in a register, serialized little endian
pub trait RegisterValue: Copy {
    /// number of bytes in board memory
    const SIZE: usize;
    fn to_le_vec(self) -> Vec<u8>;
    /// `None` if `bytes` is not exactly [Self::SIZE] long
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! register_value {
    ($($t:ty),*) => {$(
        impl RegisterValue for $t {
            const SIZE: usize = core::mem::size_of::<$t>();

            fn to_le_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
            fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    )*};
}
register_value!(u8, u16, i32);


/// board status bitmask, see [status]
pub const STATUS: Register<u8> = Register::new(0x00);
/// limit switches bitmask, see [switches]
pub const SWITCHES: Register<u8> = Register::new(0x01);
/// error bitmask raised by the board
pub const ERRORS: Register<u8> = Register::new(0x02);

/// registers of motor 1
pub const MOTOR1: MotorRegisters = MotorRegisters::at(0x10);
/// registers of motor 2
pub const MOTOR2: MotorRegisters = MotorRegisters::at(0x20);

/// size of the board register file
pub const MAP_SIZE: usize = MOTOR2.config.address() as usize + MOTOR2.config.size();


/// set of registers driving one motor, all located relative to the motor base address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MotorRegisters {
    /// write a [Control] code to act on the motor
    pub control: Register<u8>,
    /// target position in steps
    pub target: Register<i32>,
    /// current position in steps
    pub position: Register<i32>,
    /// maximum speed in steps/s
    pub max_speed: Register<u16>,
    /// acceleration in steps/s²
    pub acceleration: Register<u16>,
    /// driver configuration (microstepping, stall threshold)
    pub config: Register<u16>,
}
impl MotorRegisters {
    pub const fn at(base: Address) -> Self {
        Self {
            control: Register::new(base),
            target: Register::new(base + 0x1),
            position: Register::new(base + 0x5),
            max_speed: Register::new(base + 0x9),
            acceleration: Register::new(base + 0xB),
            config: Register::new(base + 0xD),
        }
    }
}

/// motors attached to the board
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Motor {
    One,
    Two,
}
impl Motor {
    pub const fn registers(self) -> MotorRegisters {
        match self {
            Motor::One => MOTOR1,
            Motor::Two => MOTOR2,
        }
    }
    /// motor number as used in messages
    pub const fn number(self) -> u8 {
        match self {
            Motor::One => 1,
            Motor::Two => 2,
        }
    }
}
impl TryFrom<i64> for Motor {
    type Error = i64;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Motor::One),
            2 => Ok(Motor::Two),
            other => Err(other),
        }
    }
}

/// codes written to a motor control register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    /// move toward the target position
    Start = 0x01,
    /// stop the current move
    Stop = 0x02,
    /// start homing sequence
    Home = 0x04,
}

/// bits of the [STATUS] register
pub mod status {
    pub const READY: u8 = 1 << 0;
    pub const MOTOR1_MOVING: u8 = 1 << 1;
    pub const MOTOR2_MOVING: u8 = 1 << 2;
    pub const MOTOR1_HOMING: u8 = 1 << 3;
    pub const MOTOR2_HOMING: u8 = 1 << 4;
}

/// bits of the [SWITCHES] register, set while a switch is pressed
pub mod switches {
    pub const SWITCH1: u8 = 1 << 0;
    pub const SWITCH2: u8 = 1 << 1;
}
