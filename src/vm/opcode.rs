//! Instruction set
//!
//! The machine is stack based. Every instruction carries an opcode, one
//! operand and the source span it was compiled from. The operand's meaning
//! depends on the opcode's [`OpFormat`]:
//!
//! ```text
//! PUSH_VAL    value      push a constant
//! SET_VAL     name       store the top of the stack, keep it
//! JUMPIF_F    label      absolute instruction index
//! OP_CALL     count      -1 takes the arguments from a sequence
//! STACK_OP    operator   binary operator id
//! TYPE_CHECK  type       expected type of the top of the stack
//! ```

/// Operand formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpFormat {
    /// No operand
    None,
    /// Integer count
    Int,
    /// Absolute instruction index
    Label,
    /// Constant object
    Value,
    /// Variable name (`Str`)
    Name,
    /// Type object
    Type,
    /// Binary operator id
    BinaryOp,
    /// Unary operator id
    UnaryOp,
}

/// Nest opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Do nothing
    NoOp = 0,
    /// Drop the top value: a ->
    PopVal,
    /// Call the start function of the iterator on top: it -> it r
    ForStart,
    /// Call the is_done function of the iterator on top: it -> it done
    ForIsDone,
    /// Call the get_val function of the iterator on top: it -> it v
    ForGetVal,
    /// Return the top value from the current function
    ReturnVal,
    /// Return the local variable map
    ReturnVars,
    /// Store the top value in a variable and drop it: v ->
    SetValLoc,
    /// Store into a container and drop everything: v c i ->
    SetContLoc,
    /// Unconditional jump
    Jump,
    /// Jump if the popped value is truthy
    JumpifT,
    /// Jump if the popped value is falsy
    JumpifF,
    /// Jump if the Int on top is zero, keeping it
    JumpifZero,
    /// Check the type of the top value
    TypeCheck,
    /// Check that the top value is hashable
    HashCheck,
    /// Raise an error: name message ->
    ThrowErr,
    /// Register a catch frame resuming at the label
    PushCatch,
    /// Drop the innermost catch frame
    PopCatch,
    /// Store the top value in a variable, keeping it
    SetVal,
    /// Push a variable, or null when it is not defined
    GetVal,
    /// Push a constant
    PushVal,
    /// Store into a container keeping the value: v c i -> v
    SetContVal,
    /// Call a function: args... f -> r
    OpCall,
    /// Cast a value: ty v -> r
    OpCast,
    /// Build a range iterator: [step] start stop -> it
    OpRange,
    /// Binary operator: a b -> r
    StackOp,
    /// Unary operator: a -> r
    LocalOp,
    /// Import a library: name -> lib
    OpImport,
    /// Index a container: c i -> v
    OpExtract,
    /// Decrement the Int on top in place
    DecInt,
    /// Push a fresh copy of the Int on top
    NewInt,
    /// Duplicate the top value: a -> a a
    Dup,
    /// Move the top value down: a b c -> c a b
    Rot,
    /// Build an Array from N values
    MakeArr,
    /// Build an Array repeating a value: v n -> arr
    MakeArrRep,
    /// Build a Vector from N values
    MakeVec,
    /// Build a Vector repeating a value: v n -> vec
    MakeVecRep,
    /// Build a Map from N keys and values
    MakeMap,
    /// Push the pending error as a map and clear it
    SaveError,
    /// Push the N items of a sequence with the first item on top
    UnpackSeq,
}

/// Static opcode metadata
#[derive(Debug, Clone, Copy)]
pub struct OpCodeInfo {
    /// Listing name
    pub name: &'static str,
    pub format: OpFormat,
}

impl OpCodeInfo {
    const fn new(name: &'static str, format: OpFormat) -> Self {
        OpCodeInfo { name, format }
    }
}

impl OpCode {
    /// Total number of opcodes
    pub const COUNT: usize = 40;

    pub const ALL: [OpCode; OpCode::COUNT] = [
        OpCode::NoOp,
        OpCode::PopVal,
        OpCode::ForStart,
        OpCode::ForIsDone,
        OpCode::ForGetVal,
        OpCode::ReturnVal,
        OpCode::ReturnVars,
        OpCode::SetValLoc,
        OpCode::SetContLoc,
        OpCode::Jump,
        OpCode::JumpifT,
        OpCode::JumpifF,
        OpCode::JumpifZero,
        OpCode::TypeCheck,
        OpCode::HashCheck,
        OpCode::ThrowErr,
        OpCode::PushCatch,
        OpCode::PopCatch,
        OpCode::SetVal,
        OpCode::GetVal,
        OpCode::PushVal,
        OpCode::SetContVal,
        OpCode::OpCall,
        OpCode::OpCast,
        OpCode::OpRange,
        OpCode::StackOp,
        OpCode::LocalOp,
        OpCode::OpImport,
        OpCode::OpExtract,
        OpCode::DecInt,
        OpCode::NewInt,
        OpCode::Dup,
        OpCode::Rot,
        OpCode::MakeArr,
        OpCode::MakeArrRep,
        OpCode::MakeVec,
        OpCode::MakeVecRep,
        OpCode::MakeMap,
        OpCode::SaveError,
        OpCode::UnpackSeq,
    ];

    #[inline]
    pub fn info(self) -> &'static OpCodeInfo {
        &OPCODE_INFO[self as usize]
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    #[inline]
    pub fn format(self) -> OpFormat {
        self.info().format
    }

    pub fn from_name(name: &str) -> Option<OpCode> {
        OpCode::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Instructions whose operand is an instruction index
    pub fn is_jump(self) -> bool {
        self.format() == OpFormat::Label
    }
}

/// Metadata indexed by opcode
pub static OPCODE_INFO: [OpCodeInfo; OpCode::COUNT] = [
    OpCodeInfo::new("NO_OP", OpFormat::None),
    OpCodeInfo::new("POP_VAL", OpFormat::None),
    OpCodeInfo::new("FOR_START", OpFormat::None),
    OpCodeInfo::new("FOR_IS_DONE", OpFormat::None),
    OpCodeInfo::new("FOR_GET_VAL", OpFormat::None),
    OpCodeInfo::new("RETURN_VAL", OpFormat::None),
    OpCodeInfo::new("RETURN_VARS", OpFormat::None),
    OpCodeInfo::new("SET_VAL_LOC", OpFormat::Name),
    OpCodeInfo::new("SET_CONT_LOC", OpFormat::None),
    OpCodeInfo::new("JUMP", OpFormat::Label),
    OpCodeInfo::new("JUMPIF_T", OpFormat::Label),
    OpCodeInfo::new("JUMPIF_F", OpFormat::Label),
    OpCodeInfo::new("JUMPIF_ZERO", OpFormat::Label),
    OpCodeInfo::new("TYPE_CHECK", OpFormat::Type),
    OpCodeInfo::new("HASH_CHECK", OpFormat::None),
    OpCodeInfo::new("THROW_ERR", OpFormat::None),
    OpCodeInfo::new("PUSH_CATCH", OpFormat::Label),
    OpCodeInfo::new("POP_CATCH", OpFormat::None),
    OpCodeInfo::new("SET_VAL", OpFormat::Name),
    OpCodeInfo::new("GET_VAL", OpFormat::Name),
    OpCodeInfo::new("PUSH_VAL", OpFormat::Value),
    OpCodeInfo::new("SET_CONT_VAL", OpFormat::None),
    OpCodeInfo::new("OP_CALL", OpFormat::Int),
    OpCodeInfo::new("OP_CAST", OpFormat::None),
    OpCodeInfo::new("OP_RANGE", OpFormat::Int),
    OpCodeInfo::new("STACK_OP", OpFormat::BinaryOp),
    OpCodeInfo::new("LOCAL_OP", OpFormat::UnaryOp),
    OpCodeInfo::new("OP_IMPORT", OpFormat::None),
    OpCodeInfo::new("OP_EXTRACT", OpFormat::None),
    OpCodeInfo::new("DEC_INT", OpFormat::None),
    OpCodeInfo::new("NEW_INT", OpFormat::None),
    OpCodeInfo::new("DUP", OpFormat::None),
    OpCodeInfo::new("ROT", OpFormat::Int),
    OpCodeInfo::new("MAKE_ARR", OpFormat::Int),
    OpCodeInfo::new("MAKE_ARR_REP", OpFormat::None),
    OpCodeInfo::new("MAKE_VEC", OpFormat::Int),
    OpCodeInfo::new("MAKE_VEC_REP", OpFormat::None),
    OpCodeInfo::new("MAKE_MAP", OpFormat::Int),
    OpCodeInfo::new("SAVE_ERROR", OpFormat::None),
    OpCodeInfo::new("UNPACK_SEQ", OpFormat::Int),
];
