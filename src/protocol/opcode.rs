/// Protocol operation codes.
///
/// The numeric values are part of the wire contract and must match the peer.
/// On the wire each frame payload begins with `opcode << 1 | direction`,
/// direction `0` for requests and `1` for responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    SessionInit = 0,
    SessionCancelStatement = 1,
    SessionSetId = 2,
    SessionSetAutoCommit = 3,
    SessionClose = 4,
    CommandPrepareReadParams = 5,
    CommandPrepare = 6,
    CommandQuery = 7,
    CommandPreparedQuery = 8,
    CommandUpdate = 9,
    CommandPreparedUpdate = 10,
    CommandReplicationUpdate = 11,
    CommandReplicationPreparedUpdate = 12,
    CommandDistributedTransactionQuery = 13,
    CommandDistributedTransactionPreparedQuery = 14,
    CommandDistributedTransactionUpdate = 15,
    CommandDistributedTransactionPreparedUpdate = 16,
    CommandDistributedTransactionCommit = 17,
    CommandDistributedTransactionRollback = 18,
    CommandDistributedTransactionAddSavepoint = 19,
    CommandDistributedTransactionRollbackSavepoint = 20,
    CommandDistributedTransactionValidate = 21,
    CommandBatchStatementUpdate = 22,
    CommandBatchStatementPreparedUpdate = 23,
    CommandClose = 24,
    CommandGetMetaData = 25,
    CommandReadLob = 26,
    CommandStorageGet = 27,
    CommandStoragePut = 28,
    CommandStorageDistributedGet = 29,
    CommandStorageDistributedPut = 30,
    CommandStorageReplicationPut = 31,
    CommandStorageMoveLeafPage = 32,
    CommandStorageRemoveLeafPage = 33,
    ResultFetchRows = 34,
    ResultReset = 35,
    ResultChangeId = 36,
    ResultClose = 37,
}

impl Opcode {
    /// Decode the opcode half of a header int. Returns `None` for values
    /// outside the table, which the dispatcher treats as a protocol
    /// violation.
    pub fn from_i32(value: i32) -> Option<Self> {
        use Opcode::*;
        Some(match value {
            0 => SessionInit,
            1 => SessionCancelStatement,
            2 => SessionSetId,
            3 => SessionSetAutoCommit,
            4 => SessionClose,
            5 => CommandPrepareReadParams,
            6 => CommandPrepare,
            7 => CommandQuery,
            8 => CommandPreparedQuery,
            9 => CommandUpdate,
            10 => CommandPreparedUpdate,
            11 => CommandReplicationUpdate,
            12 => CommandReplicationPreparedUpdate,
            13 => CommandDistributedTransactionQuery,
            14 => CommandDistributedTransactionPreparedQuery,
            15 => CommandDistributedTransactionUpdate,
            16 => CommandDistributedTransactionPreparedUpdate,
            17 => CommandDistributedTransactionCommit,
            18 => CommandDistributedTransactionRollback,
            19 => CommandDistributedTransactionAddSavepoint,
            20 => CommandDistributedTransactionRollbackSavepoint,
            21 => CommandDistributedTransactionValidate,
            22 => CommandBatchStatementUpdate,
            23 => CommandBatchStatementPreparedUpdate,
            24 => CommandClose,
            25 => CommandGetMetaData,
            26 => CommandReadLob,
            27 => CommandStorageGet,
            28 => CommandStoragePut,
            29 => CommandStorageDistributedGet,
            30 => CommandStorageDistributedPut,
            31 => CommandStorageReplicationPut,
            32 => CommandStorageMoveLeafPage,
            33 => CommandStorageRemoveLeafPage,
            34 => ResultFetchRows,
            35 => ResultReset,
            36 => ResultChangeId,
            37 => ResultClose,
            _ => return None,
        })
    }

    pub fn request_header(self) -> i32 {
        (self as i32) << 1
    }

    pub fn response_header(self) -> i32 {
        (self as i32) << 1 | 1
    }

    /// Distributed-transaction variants force the session out of
    /// auto-commit before sharing the plain handler.
    pub fn is_distributed(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            CommandDistributedTransactionQuery
                | CommandDistributedTransactionPreparedQuery
                | CommandDistributedTransactionUpdate
                | CommandDistributedTransactionPreparedUpdate
                | CommandStorageDistributedGet
                | CommandStorageDistributedPut
        )
    }
}

/// Split a header int into direction and raw opcode value.
pub fn split_header(header: i32) -> (bool, i32) {
    let is_request = header & 1 == 0;
    (is_request, header >> 1)
}
